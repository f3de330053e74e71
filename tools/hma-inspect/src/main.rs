// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! hma-inspect - Inspect an HMA coordination file
//!
//! Maps an `X-hma` coordination file read-only and prints its DMS,
//! client-slot, and page-lock state. Never takes any lock itself.

use clap::Parser;
use colored::*;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use hma::{HmaLayout, CLIENT_SLOTS, PAGE_LOCK_SLOTS};

/// Inspect an HMA coordination file
#[derive(Parser, Debug)]
#[command(name = "hma-inspect")]
#[command(version = "0.1.0")]
#[command(about = "Inspect an HMA coordination file")]
struct Args {
    /// Path to the database file (its `-hma` sibling is inspected) or to
    /// the `-hma` file itself
    path: PathBuf,

    /// Show every occupied page-lock slot, not just the summary
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Output format: pretty, json
    #[arg(short, long, default_value = "pretty")]
    format: OutputFormat,

    /// Client slot count of the file being inspected, if non-default
    #[arg(long, default_value_t = CLIENT_SLOTS)]
    client_slots: u32,

    /// Page-lock slot count of the file being inspected, if non-default
    #[arg(long, default_value_t = PAGE_LOCK_SLOTS)]
    page_lock_slots: u32,
}

#[derive(Clone, Debug)]
enum OutputFormat {
    Pretty,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "p" => Ok(OutputFormat::Pretty),
            "json" | "j" => Ok(OutputFormat::Json),
            _ => Err(format!("unknown format: {s}")),
        }
    }
}

struct ClientSlot {
    client_id: u32,
    occupied: bool,
}

struct PageSlot {
    slot: u32,
    readers: Vec<u32>,
    writer: Option<u32>,
}

struct Snapshot {
    dms: u32,
    clients: Vec<ClientSlot>,
    pages: Vec<PageSlot>,
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let hma_path = resolve_hma_path(&args.path);
    let layout = HmaLayout {
        client_slots: args.client_slots,
        page_lock_slots: args.page_lock_slots,
    };

    let snapshot = read_snapshot(&hma_path, layout)?;

    match args.format {
        OutputFormat::Pretty => print_pretty(&hma_path, &snapshot, args.verbose),
        OutputFormat::Json => print_json(&snapshot),
    }

    Ok(())
}

/// `X` -> `X-hma`, or pass through a path already ending in `-hma`.
fn resolve_hma_path(path: &Path) -> PathBuf {
    if path.extension().map(|e| e == "hma").unwrap_or(false)
        || path.as_os_str().to_string_lossy().ends_with("-hma")
    {
        return path.to_path_buf();
    }
    let mut s = path.as_os_str().to_os_string();
    s.push("-hma");
    PathBuf::from(s)
}

fn read_snapshot(
    hma_path: &Path,
    layout: HmaLayout,
) -> Result<Snapshot, Box<dyn std::error::Error>> {
    let c_path = CString::new(hma_path.as_os_str().as_encoded_bytes())?;

    // SAFETY: `c_path` is a valid NUL-terminated path; opened read-only so
    // this process never contends for any advisory lock on the file.
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        return Err(format!(
            "failed to open {}: {}",
            hma_path.display(),
            std::io::Error::last_os_error()
        )
        .into());
    }

    let file_size = layout.file_size();

    // SAFETY: `fd` is open for reading; the mapping is only read through
    // atomic loads below and is unmapped before returning.
    let map = unsafe {
        libc::mmap(
            ptr::null_mut(),
            file_size,
            libc::PROT_READ,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    // SAFETY: `fd` is not used again after this point.
    unsafe { libc::close(fd) };

    if map == libc::MAP_FAILED {
        return Err(format!(
            "failed to map {}: {}",
            hma_path.display(),
            std::io::Error::last_os_error()
        )
        .into());
    }

    let word = |idx: usize| -> u32 {
        // SAFETY: `idx` is checked against `file_size / 4` by every call
        // site below, and `map` is a valid read-only mapping of exactly
        // `file_size` bytes.
        unsafe { (&*(map as *const AtomicU32).add(idx)).load(Ordering::Relaxed) }
    };

    let dms = word(layout.dms_word());

    let clients = (0..layout.client_slots)
        .map(|client_id| ClientSlot {
            client_id,
            occupied: word(layout.client_word(client_id)) != 0,
        })
        .collect();

    let mut pages = Vec::new();
    for slot in 0..layout.page_lock_slots {
        let v = word(layout.page_lock_word(slot));
        if v == 0 {
            continue;
        }
        let readers: Vec<u32> = (0..layout.client_slots)
            .filter(|&c| v & (1 << c) != 0)
            .collect();
        let raw = v >> layout.client_slots;
        let writer = if raw == 0 { None } else { Some(raw - 1) };
        pages.push(PageSlot {
            slot,
            readers,
            writer,
        });
    }

    // SAFETY: `map` came from the successful mmap above, sized `file_size`.
    unsafe { libc::munmap(map, file_size) };

    Ok(Snapshot {
        dms,
        clients,
        pages,
    })
}

fn print_pretty(hma_path: &Path, snap: &Snapshot, verbose: bool) {
    println!();
    println!("{}", format!("=== {} ===", hma_path.display()).bold());
    println!();

    println!("DMS word: 0x{:08X}", snap.dms);

    let occupied: Vec<&ClientSlot> = snap.clients.iter().filter(|c| c.occupied).collect();
    println!(
        "Client slots: {}/{} occupied: {}",
        occupied.len(),
        snap.clients.len(),
        occupied
            .iter()
            .map(|c| c.client_id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
            .green()
    );

    println!("Page-lock slots in use: {}", snap.pages.len());
    if verbose {
        for page in &snap.pages {
            let writer_str = match page.writer {
                Some(w) => format!("writer={w}").red().to_string(),
                None => "writer=none".to_string(),
            };
            println!(
                "  slot {:>7}: readers=[{}] {}",
                page.slot,
                page.readers
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                writer_str
            );
        }
    }
    println!();
}

fn print_json(snap: &Snapshot) {
    print!("{{\"dms\":{},\"clients\":[", snap.dms);
    for (i, c) in snap.clients.iter().enumerate() {
        if i > 0 {
            print!(",");
        }
        print!(
            "{{\"client_id\":{},\"occupied\":{}}}",
            c.client_id, c.occupied
        );
    }
    print!("],\"pages\":[");
    for (i, p) in snap.pages.iter().enumerate() {
        if i > 0 {
            print!(",");
        }
        let writer = match p.writer {
            Some(w) => w.to_string(),
            None => "null".to_string(),
        };
        print!(
            "{{\"slot\":{},\"readers\":{:?},\"writer\":{}}}",
            p.slot, p.readers, writer
        );
    }
    println!("]}}");
}
