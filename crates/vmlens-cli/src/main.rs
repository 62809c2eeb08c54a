//! CLI for vmlens host-side VM memory introspection.
//!
//! Points at the file backing a guest's physical RAM (e.g. a QEMU
//! `memory-backend-file` object) and decodes what the in-guest beacon
//! companion publishes there, or walks the guest's own page tables.
//!
//! # Usage
//!
//! ```bash
//! # Latest complete PID snapshot
//! vmlens --mem-file /dev/shm/guest-ram pids
//!
//! # Full process table, as JSON
//! vmlens --mem-file /dev/shm/guest-ram ps --json
//!
//! # Section map of pid 1234 as seen by camera 1
//! vmlens --mem-file /dev/shm/guest-ram sections --camera 1 --pid 1234
//!
//! # Point camera 2 at a new target (needs a writable mapping)
//! vmlens --mem-file /dev/shm/guest-ram focus --camera 2 --pid 1234
//!
//! # Translate a guest VA by walking the guest page tables directly
//! vmlens --mem-file /dev/shm/guest-ram translate \
//!     --arch arm64 --root 0x40A000 --va 0x55551000
//! ```

use clap::{Parser, Subcommand};
use std::sync::Arc;

use vmlens_host::backend::MemoryBackend;
use vmlens_host::beacon::{BeaconReader, CameraId};
use vmlens_host::walker::{Arm64Walker, PageTableWalker, X86_64Walker};

#[derive(Parser)]
#[command(name = "vmlens")]
#[command(about = "Inspect a running VM's memory through its RAM-backing file")]
#[command(version)]
struct Cli {
    /// Path to the file backing guest physical RAM.
    #[arg(short, long, global = true, default_value = "/dev/shm/guest-ram")]
    mem_file: String,

    /// Emit machine-readable JSON instead of tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the latest complete PID snapshot.
    Pids,

    /// List every PID generation currently visible, complete or not.
    Generations,

    /// Print the process table from the scan category.
    Ps,

    /// Print details for a single process.
    Proc {
        #[arg(short, long)]
        pid: u32,
    },

    /// Print the section map a camera has published for a process.
    Sections {
        /// Camera channel (1 or 2).
        #[arg(short, long)]
        camera: u8,

        #[arg(short, long)]
        pid: u32,
    },

    /// Print the VA→PA entries a camera has published for a process.
    Ptes {
        /// Camera channel (1 or 2).
        #[arg(short, long)]
        camera: u8,

        #[arg(short, long)]
        pid: u32,
    },

    /// Ask the guest to point a camera at a new target process.
    Focus {
        /// Camera channel (1 or 2).
        #[arg(short, long)]
        camera: u8,

        #[arg(short, long)]
        pid: u32,
    },

    /// Show beacon health: per-category page counts and camera states.
    Status,

    /// Translate a guest VA by walking the guest's page tables.
    Translate {
        /// Guest architecture: "arm64" or "x86_64".
        #[arg(short, long)]
        arch: String,

        /// Page-table root (TTBR / CR3 value), hex accepted with 0x.
        #[arg(short, long, value_parser = parse_u64)]
        root: u64,

        /// Virtual address to translate, hex accepted with 0x.
        #[arg(short, long, value_parser = parse_u64)]
        va: u64,

        /// Use 5-level paging (x86-64 LA57 guests only).
        #[arg(long)]
        la57: bool,
    },
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        s.parse().map_err(|e: std::num::ParseIntError| e.to_string())
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Pids => cmd_pids(&cli.mem_file, cli.json),
        Commands::Generations => cmd_generations(&cli.mem_file, cli.json),
        Commands::Ps => cmd_ps(&cli.mem_file, cli.json),
        Commands::Proc { pid } => cmd_proc(&cli.mem_file, pid, cli.json),
        Commands::Sections { camera, pid } => cmd_sections(&cli.mem_file, camera, pid, cli.json),
        Commands::Ptes { camera, pid } => cmd_ptes(&cli.mem_file, camera, pid, cli.json),
        Commands::Focus { camera, pid } => cmd_focus(&cli.mem_file, camera, pid),
        Commands::Status => cmd_status(&cli.mem_file, cli.json),
        Commands::Translate { arch, root, va, la57 } => {
            cmd_translate(&cli.mem_file, &arch, root, va, la57)
        }
    }
}

fn camera_id(camera: u8) -> CameraId {
    match camera {
        1 => CameraId::One,
        2 => CameraId::Two,
        other => {
            eprintln!("Error: camera must be 1 or 2, got {}", other);
            std::process::exit(1);
        }
    }
}

fn open_reader(mem_file: &str, writable: bool) -> BeaconReader {
    let backend = if writable {
        MemoryBackend::map_rw(mem_file)
    } else {
        MemoryBackend::map(mem_file)
    };
    let backend = match backend {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    match BeaconReader::new(backend) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => {
            eprintln!("Error: failed to serialize output: {}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_pids(mem_file: &str, json: bool) {
    let reader = open_reader(mem_file, false);
    let Some(generation) = reader.latest_complete_generation() else {
        eprintln!("No complete PID generation available (writer mid-pass or absent)");
        std::process::exit(1);
    };

    if json {
        print_json(&generation);
        return;
    }
    println!(
        "Generation {} ({} PIDs):",
        generation.generation, generation.total_pids
    );
    for pid in &generation.pids {
        println!("  {}", pid);
    }
}

fn cmd_generations(mem_file: &str, json: bool) {
    let reader = open_reader(mem_file, false);
    let generations = reader.pid_generations();

    if json {
        print_json(&generations);
        return;
    }
    if generations.is_empty() {
        println!("No PID generations visible");
        return;
    }
    println!("{:>12}  {:>6}  {:>6}  state", "generation", "total", "seen");
    for g in &generations {
        println!(
            "{:>12}  {:>6}  {:>6}  {}",
            g.generation,
            g.total_pids,
            g.pids.len(),
            if g.complete { "complete" } else { "partial" }
        );
    }
}

fn cmd_ps(mem_file: &str, json: bool) {
    let reader = open_reader(mem_file, false);
    let processes = reader.processes();

    if json {
        let list: Vec<_> = processes.values().collect();
        print_json(&list);
        return;
    }
    println!(
        "{:>7} {:>7} {:>5} {:>2} {:>10} {:>10}  {:<16} {}",
        "PID", "PPID", "UID", "ST", "VSZ(kB)", "RSS(kB)", "COMM", "EXE"
    );
    for p in processes.values() {
        println!(
            "{:>7} {:>7} {:>5} {:>2} {:>10} {:>10}  {:<16} {}",
            p.pid, p.ppid, p.uid, p.state, p.vsize_kb, p.rss_kb, p.comm, p.exe_path
        );
    }
}

fn cmd_proc(mem_file: &str, pid: u32, json: bool) {
    let reader = open_reader(mem_file, false);
    let Some(process) = reader.process(pid) else {
        eprintln!("Error: pid {} not present in the scan data", pid);
        std::process::exit(1);
    };

    if json {
        print_json(&process);
        return;
    }
    println!("pid:        {}", process.pid);
    println!("ppid:       {}", process.ppid);
    println!("uid/gid:    {}/{}", process.uid, process.gid);
    println!("state:      {}", process.state);
    println!("comm:       {}", process.comm);
    println!("exe:        {}", process.exe_path);
    println!("vsize:      {} kB", process.vsize_kb);
    println!("rss:        {} kB", process.rss_kb);
    println!("start_time: {}", process.start_time);
    println!("cpu_time:   {}", process.cpu_time);
}

fn perms_string(perms: u32) -> String {
    let mut s = String::with_capacity(4);
    s.push(if perms & 0x1 != 0 { 'r' } else { '-' });
    s.push(if perms & 0x2 != 0 { 'w' } else { '-' });
    s.push(if perms & 0x4 != 0 { 'x' } else { '-' });
    s.push(if perms & 0x8 != 0 { 'p' } else { 's' });
    s
}

fn cmd_sections(mem_file: &str, camera: u8, pid: u32, json: bool) {
    let camera = camera_id(camera);
    let reader = open_reader(mem_file, false);
    let sections = reader.camera_sections(camera, pid);

    if json {
        print_json(&sections);
        return;
    }
    if sections.is_empty() {
        println!(
            "No sections for pid {} on camera {:?} (is the camera focused on it?)",
            pid, camera
        );
        return;
    }
    for s in &sections {
        println!(
            "{:#014x}-{:#014x} {} {}",
            s.va_start,
            s.va_end,
            perms_string(s.perms),
            s.path
        );
    }
}

fn cmd_ptes(mem_file: &str, camera: u8, pid: u32, json: bool) {
    let camera = camera_id(camera);
    let reader = open_reader(mem_file, false);
    let ptes = reader.camera_ptes(camera, pid);

    if json {
        let list: Vec<_> = ptes
            .iter()
            .map(|(va, pa)| serde_json::json!({ "va": va, "pa": pa }))
            .collect();
        print_json(&list);
        return;
    }
    println!("{:>16}  {:>16}", "VA", "PA");
    for (va, pa) in &ptes {
        println!("{:#16x}  {:#16x}", va, pa);
    }
    println!("{} entries", ptes.len());
}

fn cmd_focus(mem_file: &str, camera: u8, pid: u32) {
    let camera = camera_id(camera);
    let mut reader = open_reader(mem_file, true);

    if let Err(e) = reader.set_camera_focus(camera, pid) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    println!("Camera {:?} focus change to pid {} requested", camera, pid);
    if let Some(current) = reader.camera_focus(camera) {
        println!("Guest currently servicing pid {}", current);
    }
}

fn cmd_status(mem_file: &str, json: bool) {
    let reader = open_reader(mem_file, false);
    let stats = reader.category_stats();

    if json {
        print_json(&stats);
        return;
    }

    println!("═══════════════════════════════════════════════════════════════════════");
    println!("  vmlens beacon status");
    println!("═══════════════════════════════════════════════════════════════════════");
    println!();
    println!("Session: {}", reader.session_id());
    println!();
    println!("{:>10}  {:>9}  {:>9}  {:>6}", "category", "expected", "reachable", "valid");
    for s in &stats {
        println!(
            "{:>10}  {:>9}  {:>9}  {:>6}",
            s.category, s.expected_pages, s.reachable_pages, s.valid_pages
        );
    }
    println!();
    for camera in [CameraId::One, CameraId::Two] {
        match (reader.camera_status(camera), reader.camera_focus(camera)) {
            (Some(status), Some(pid)) => {
                println!("Camera {:?}: {:?}, servicing pid {}", camera, status, pid)
            }
            _ => println!("Camera {:?}: control page absent or torn", camera),
        }
    }
}

fn cmd_translate(mem_file: &str, arch: &str, root: u64, va: u64, la57: bool) {
    let backend = match MemoryBackend::map(mem_file) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let walker: Box<dyn PageTableWalker> = match arch {
        "arm64" | "aarch64" => {
            if la57 {
                eprintln!("Error: --la57 only applies to x86_64 guests");
                std::process::exit(1);
            }
            Box::new(Arm64Walker::new(backend))
        }
        "x86_64" | "x86-64" | "amd64" => {
            if la57 {
                Box::new(X86_64Walker::with_la57(backend))
            } else {
                Box::new(X86_64Walker::new(backend))
            }
        }
        other => {
            eprintln!("Error: unknown architecture '{}'. Use 'arm64' or 'x86_64'.", other);
            std::process::exit(1);
        }
    };

    match walker.translate(root, va) {
        Some(m) => {
            println!("va:        {:#x}", va);
            println!("pa:        {:#x}", m.pa);
            println!("page_size: {:#x}", m.page_size);
            println!(
                "flags:     {}{}{}",
                if m.writable { "w" } else { "-" },
                if m.user { "u" } else { "-" },
                if m.no_execute { "-" } else { "x" }
            );
        }
        None => {
            println!("va {:#x}: unmapped", va);
            std::process::exit(2);
        }
    }
}
