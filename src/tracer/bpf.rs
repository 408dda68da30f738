//! Kernel probe loading, attachment and ring buffer reading.
//!
//! Implements [`EventSource`] using aya. All code is gated behind
//! `#[cfg(feature = "bpf")]`.

use anyhow::{Context, Result};
use tokio::io::unix::AsyncFd;

use aya::maps::{MapData, PerCpuArray, RingBuf};
use aya::programs::KProbe;
use aya::{Ebpf, EbpfLoader};

use super::event::RawEventRecord;
use super::parse::parse_record;
use super::{EventSource, SourceError};

/// Compiled probe object, embedded at build time.
///
/// Uses `include_bytes_aligned!` so aya's ELF parser sees an 8-byte aligned
/// pointer.
const BPF_OBJ: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/parrotty.bpf.o"));

/// Probe programs and the kernel symbols they attach to.
const KPROBES: &[(&str, &str)] = &[
    ("kprobe_tty_write", "tty_write"),
    (
        "kprobe_n_tty_receive_buf_common",
        "n_tty_receive_buf_common",
    ),
];

/// Probe attachment statistics for Prometheus metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachmentStats {
    pub kprobes_attached: u32,
}

/// Ring-buffer backed source fed by the terminal kprobes.
pub struct BpfSource {
    ring: AsyncFd<RingBuf<MapData>>,
    dropped: PerCpuArray<MapData, u64>,
    attach_stats: AttachmentStats,
    // Dropping the Ebpf object detaches all programs.
    _ebpf: Ebpf,
}

impl BpfSource {
    /// Load the probe with the given ring buffer size (bytes) and attach it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(ring_buf_size: u32) -> Result<Self> {
        let mut ebpf = EbpfLoader::new()
            .set_max_entries("events", ring_buf_size)
            .load(BPF_OBJ)
            .context("loading BPF objects")?;

        let attach_stats = attach_programs(&mut ebpf)?;
        tracing::info!(
            kprobes_attached = attach_stats.kprobes_attached,
            "BPF program attachment summary"
        );

        let events_map = ebpf
            .take_map("events")
            .ok_or_else(|| anyhow::anyhow!("events map not found"))?;
        let ring_buf =
            RingBuf::try_from(events_map).context("creating ring buffer from events map")?;

        let dropped_map = ebpf
            .take_map("dropped")
            .ok_or_else(|| anyhow::anyhow!("dropped map not found"))?;
        let dropped =
            PerCpuArray::try_from(dropped_map).context("opening dropped counter map")?;

        let ring = AsyncFd::new(ring_buf).context("creating async fd for ring buffer")?;

        Ok(Self {
            ring,
            dropped,
            attach_stats,
            _ebpf: ebpf,
        })
    }

    /// Return a copy of the attachment statistics.
    pub fn attachment_stats(&self) -> AttachmentStats {
        self.attach_stats
    }
}

impl EventSource for BpfSource {
    fn name(&self) -> &str {
        "bpf"
    }

    async fn recv(&mut self) -> Result<RawEventRecord, SourceError> {
        loop {
            let mut guard = self.ring.readable_mut().await?;

            let parsed = guard
                .get_inner_mut()
                .next()
                .map(|item| parse_record(&item));

            match parsed {
                Some(result) => return result.map_err(SourceError::from),
                None => guard.clear_ready(),
            }
        }
    }

    fn dropped(&self) -> Option<u64> {
        match self.dropped.get(&0, 0) {
            Ok(values) => Some(values.iter().sum()),
            Err(e) => {
                tracing::debug!(error = %e, "reading dropped counter map");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// BPF program attachment
// ---------------------------------------------------------------------------

fn attach_programs(ebpf: &mut Ebpf) -> Result<AttachmentStats> {
    let mut stats = AttachmentStats::default();

    for (prog_name, symbol) in KPROBES {
        attach_kprobe_required(ebpf, prog_name, symbol, &mut stats)?;
    }

    Ok(stats)
}

fn attach_kprobe_required(
    ebpf: &mut Ebpf,
    prog_name: &str,
    symbol: &str,
    stats: &mut AttachmentStats,
) -> Result<()> {
    let prog: &mut KProbe = ebpf
        .program_mut(prog_name)
        .ok_or_else(|| anyhow::anyhow!("kprobe program '{prog_name}' not found"))?
        .try_into()
        .with_context(|| format!("'{prog_name}' is not a kprobe program"))?;
    prog.load()
        .with_context(|| format!("loading kprobe {symbol}"))?;
    prog.attach(symbol, 0)
        .with_context(|| format!("attaching kprobe {symbol}"))?;

    stats.kprobes_attached += 1;
    tracing::debug!(symbol, "attached kprobe");

    Ok(())
}
