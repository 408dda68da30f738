//! Host-wide terminal activity tracer.
//!
//! Kernel probes on the tty write and receive paths deliver raw records into a
//! bounded buffer; the [`assembler`] drains it, converts boot-relative
//! timestamps to wall-clock time, splits packed process ids and forwards each
//! event to a [`sink`] in arrival order.

pub mod agent;
pub mod assembler;
pub mod clock;
pub mod config;
pub mod correlate;
pub mod export;
pub mod identity;
pub mod sink;
pub mod tracer;
