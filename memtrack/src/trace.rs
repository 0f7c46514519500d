//! Text traces and synthetic workloads.
//!
//! One event per line:
//!
//! ```text
//! # comment
//! alloc 0x7f0010 64 align=16 owner=3 tag=1
//! alloc 0x7f0050 128 realloc
//! free 0x7f0010
//! ```
//!
//! Numbers are decimal or `0x` prefixed hex.

use std::{
    fmt,
    io::{BufRead, Write},
};

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{Error, Metadata, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    Alloc { address: u64, metadata: Metadata },
    Free { address: u64 },
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::Alloc { address, metadata } => {
                write!(f, "alloc {address:#x} {}", metadata.size)?;
                if metadata.alignment != 0 {
                    write!(f, " align={}", metadata.alignment)?;
                }
                if metadata.owner != 0 {
                    write!(f, " owner={:#x}", metadata.owner)?;
                }
                if metadata.tag != 0 {
                    write!(f, " tag={}", metadata.tag)?;
                }
                if metadata.is_realloc {
                    write!(f, " realloc")?;
                }
                Ok(())
            }
            TraceEvent::Free { address } => write!(f, "free {address:#x}"),
        }
    }
}

fn parse_number(token: &str) -> std::result::Result<u64, String> {
    let parsed = match token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => token.parse(),
    };
    parsed.map_err(|e| format!("invalid number `{token}`: {e}"))
}

fn parse_u32(token: &str) -> std::result::Result<u32, String> {
    let value = parse_number(token)?;
    u32::try_from(value).map_err(|_| format!("`{token}` does not fit 32 bits"))
}

/// Parses one line. Blank and comment lines yield `None`.
pub fn parse_line(line: &str) -> std::result::Result<Option<TraceEvent>, String> {
    let line = line.split('#').next().unwrap_or_default();
    let mut tokens = line.split_whitespace();
    let Some(kind) = tokens.next() else {
        return Ok(None);
    };

    let address = tokens
        .next()
        .ok_or_else(|| format!("`{kind}` without address"))
        .and_then(parse_number)?;

    let event = match kind {
        "free" => TraceEvent::Free { address },
        "alloc" => {
            let size = tokens
                .next()
                .ok_or_else(|| "alloc without size".to_string())
                .and_then(parse_number)?;
            let mut metadata = Metadata {
                size,
                ..Default::default()
            };
            for token in tokens.by_ref() {
                match token.split_once('=') {
                    Some(("align", v)) => metadata.alignment = parse_u32(v)?,
                    Some(("owner", v)) => metadata.owner = parse_number(v)?,
                    Some(("tag", v)) => metadata.tag = parse_u32(v)?,
                    None if token == "realloc" => metadata.is_realloc = true,
                    _ => return Err(format!("unknown alloc attribute `{token}`")),
                }
            }
            TraceEvent::Alloc { address, metadata }
        }
        other => return Err(format!("unknown event `{other}`")),
    };

    if let Some(extra) = tokens.next() {
        return Err(format!("unexpected `{extra}`"));
    }
    Ok(Some(event))
}

/// Streams [`TraceEvent`]s out of a text trace.
pub struct TraceReader<R> {
    reader: R,
    line: usize,
    buf: String,
}

impl<R: BufRead> TraceReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            buf: String::new(),
        }
    }

    /// Number of lines consumed so far.
    pub fn line(&self) -> usize {
        self.line
    }
}

impl<R: BufRead> Iterator for TraceReader<R> {
    type Item = Result<TraceEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => self.line += 1,
                Err(e) => return Some(Err(Error::Io(e))),
            }
            match parse_line(&self.buf) {
                Ok(Some(event)) => return Some(Ok(event)),
                Ok(None) => continue,
                Err(reason) => {
                    return Some(Err(Error::Parse {
                        line: self.line,
                        reason,
                    }));
                }
            }
        }
    }
}

pub fn write_trace<W: Write>(
    mut out: W,
    events: impl IntoIterator<Item = TraceEvent>,
) -> Result<()> {
    for event in events {
        writeln!(out, "{event}")?;
    }
    out.flush()?;
    Ok(())
}

// ── Synthetic workloads ──────────────────────────────────────────────

/// Random well-formed event stream: frees only target live addresses
/// and freed addresses are eventually reused.
pub struct SyntheticWorkload {
    rng: StdRng,
    remaining: usize,
    max_live: usize,
    live: Vec<u64>,
    released: Vec<u64>,
    next_address: u64,
}

impl SyntheticWorkload {
    const BASE_ADDRESS: u64 = 0x7f00_0000_0000;

    pub fn new(seed: u64, events: usize, max_live: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            remaining: events,
            max_live: max_live.max(1),
            live: Vec::new(),
            released: Vec::new(),
            next_address: Self::BASE_ADDRESS,
        }
    }

    /// Allocations live at this point of the stream.
    pub fn live(&self) -> usize {
        self.live.len()
    }

    fn next_alloc(&mut self) -> TraceEvent {
        let size_class = self.rng.random_range(3..14u32);
        let size = self.rng.random_range(1..=1u64 << size_class);
        let alignment = if size >= 64 { 16 } else { 8 };
        let address = if !self.released.is_empty() && self.rng.random_bool(0.6) {
            let index = self.rng.random_range(0..self.released.len());
            self.released.swap_remove(index)
        } else {
            let address = self.next_address;
            self.next_address += size.next_multiple_of(16);
            address
        };
        self.live.push(address);

        TraceEvent::Alloc {
            address,
            metadata: Metadata {
                owner: 0x40_0000 + 0x40 * self.rng.random_range(0..64),
                size,
                alignment,
                tag: self.rng.random_range(0..8),
                is_realloc: self.rng.random_bool(0.05),
            },
        }
    }

    fn next_free(&mut self) -> TraceEvent {
        // Prefer young allocations so most lifetimes stay short.
        let len = self.live.len();
        let window = len.min(64);
        let index = if self.rng.random_bool(0.9) {
            len - 1 - self.rng.random_range(0..window)
        } else {
            self.rng.random_range(0..len)
        };
        let address = self.live.swap_remove(index);
        self.released.push(address);
        TraceEvent::Free { address }
    }
}

impl Iterator for SyntheticWorkload {
    type Item = TraceEvent;

    fn next(&mut self) -> Option<TraceEvent> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let alloc = self.live.is_empty()
            || (self.live.len() < self.max_live && self.rng.random_bool(0.5));
        Some(if alloc {
            self.next_alloc()
        } else {
            self.next_free()
        })
    }
}
