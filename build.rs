use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

fn main() {
    println!("cargo:rerun-if-changed=bpf/");
    println!("cargo:rerun-if-changed=build.rs");

    // The kernel probe is only compiled for the `bpf` feature.
    if env::var_os("CARGO_FEATURE_BPF").is_none() {
        return;
    }

    // BPF compilation is Linux-only.
    if env::var("CARGO_CFG_TARGET_OS").unwrap_or_default() != "linux" {
        println!("cargo:warning=BPF compilation skipped on non-Linux target");
        return;
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    let manifest_dir =
        PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));

    let bpf_src = manifest_dir.join("bpf/parrotty.bpf.c");
    let bpf_out = out_dir.join("parrotty.bpf.o");

    // Determine target architecture for BPF.
    let target_arch = match env::var("CARGO_CFG_TARGET_ARCH")
        .unwrap_or_default()
        .as_str()
    {
        "x86_64" => "x86",
        "aarch64" => "arm64",
        arch => {
            println!("cargo:warning=Unsupported BPF target arch: {arch}, defaulting to x86");
            "x86"
        }
    };

    let bpf_cflags = format!("-D__TARGET_ARCH_{target_arch}");

    let headers_dir = vmlinux_dir(&manifest_dir.join("bpf/headers"), &out_dir);

    let status = Command::new("clang")
        .args([
            "-O2",
            "-g",
            "-Wall",
            "-Werror",
            "-target",
            "bpf",
            &bpf_cflags,
            "-I",
            headers_dir.to_str().expect("valid path"),
            "-I",
            manifest_dir
                .join("bpf/include")
                .to_str()
                .expect("valid path"),
            "-c",
            bpf_src.to_str().expect("valid path"),
            "-o",
            bpf_out.to_str().expect("valid path"),
        ])
        .status()
        .expect("failed to execute clang - is it installed?");

    if !status.success() {
        eprintln!("BPF compilation failed with status: {status}");
        std::process::exit(1);
    }
}

/// Directory holding vmlinux.h: the checked-in copy if present, otherwise one
/// dumped from the running kernel's BTF with bpftool.
fn vmlinux_dir(checked_in: &Path, out_dir: &Path) -> PathBuf {
    if checked_in.join("vmlinux.h").exists() {
        return checked_in.to_path_buf();
    }

    let header = out_dir.join("vmlinux.h");
    let file = File::create(&header).expect("creating vmlinux.h");
    let status = Command::new("bpftool")
        .args(["btf", "dump", "file", "/sys/kernel/btf/vmlinux", "format", "c"])
        .stdout(Stdio::from(file))
        .status()
        .expect("failed to execute bpftool - is it installed?");

    if !status.success() {
        eprintln!("generating vmlinux.h failed with status: {status}");
        std::process::exit(1);
    }

    out_dir.to_path_buf()
}
