#![allow(dead_code)]
#![allow(unused_variables)]
#![allow(unused_imports)]
use konan_heap::{*, error::*, util::*, log::*, procfs::*, settings::*, context::*, pretty::*, value::*};
use std::{process, sync::Arc, str::FromStr};
use libc::pid_t;

fn usage(program: &str) -> ! {
    eprintln!("usage: {} -p pid [--abi-marker 0xaddr] [--depth n] [--max-children n] [--hex] [--type] [--path a.b.c] 0xaddr...", program);
    process::exit(1);
}

fn main() {
    let mut settings = Settings::default();
    let mut pid: Option<pid_t> = None;
    let mut abi_marker: Option<usize> = None;
    let mut type_only = false;
    let mut path: Option<String> = None;
    let mut flags = DisplayFlags::empty();
    let mut roots: Vec<usize> = Vec::new();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1usize;
    while i < args.len() {
        match &args[i][..] {
            "-p" => {
                pid = args.get(i+1).map_or(None, |s| pid_t::from_str(s).ok());
                if pid.is_none() {
                    usage(&args[0]);
                }
                i += 2;
            }
            "--abi-marker" => {
                abi_marker = args.get(i+1).map_or(None, |s| parse_addr(s));
                if abi_marker.is_none() {
                    eprintln!("--abi-marker requires an address");
                    process::exit(1);
                }
                i += 2;
            }
            "--depth" | "--max-children" => {
                let n = match args.get(i+1).map_or(None, |s| usize::from_str(s).ok()) {
                    Some(n) => n,
                    None => {
                        eprintln!("{} requires a number", args[i]);
                        process::exit(1);
                    }
                };
                if args[i] == "--depth" {
                    settings.print_depth = n;
                } else {
                    settings.print_max_children = n;
                }
                i += 2;
            }
            "--path" => {
                path = args.get(i+1).cloned();
                if path.is_none() {
                    eprintln!("--path requires an argument");
                    process::exit(1);
                }
                i += 2;
            }
            "--type" => {
                type_only = true;
                i += 1;
            }
            "--hex" => {
                flags.insert(DisplayFlags::HEX);
                i += 1;
            }
            x if x.starts_with("-") => {
                eprintln!("unrecognized argument: '{}'", x);
                process::exit(1);
            }
            x => {
                match parse_addr(x) {
                    Some(a) => roots.push(a),
                    None => {
                        eprintln!("bad address: '{}'", x);
                        process::exit(1);
                    }
                }
                i += 1;
            }
        }
    }
    let pid = match pid {
        Some(p) => p,
        None => usage(&args[0]),
    };
    if roots.is_empty() {
        usage(&args[0]);
    }

    // Fail early and clearly if we can't even look at the process.
    if let Err(e) = MemMapsInfo::read_proc_maps(pid) {
        eprintln!("error: can't read memory maps of pid {}: {}", pid, e);
        process::exit(1);
    }

    let memory = MemReader::Pid(PidMemReader::new(pid));
    let settings = Arc::new(settings);
    let insp = match abi_marker {
        Some(m) => match Inspector::with_abi_marker(memory, settings, m) {
            Ok(x) => x,
            Err(e) => {
                eprintln!("error: {} {}", e.marker(), e);
                process::exit(1);
            }
        }
        None => Inspector::new(memory, settings),
    };

    let mut failed = false;
    for &root in &roots {
        let _prof = ProfileScope::with_threshold(1.0, format!("inspecting 0x{:x}", root));
        if type_only {
            match insp.describe_object_type(root) {
                Ok(d) => print!("{}", d),
                Err(e) => {
                    println!("0x{:x}: {}", root, e.marker());
                    eprintln!("error: {}", e);
                    failed = true;
                }
            }
        } else if let Some(p) = &path {
            match field_by_path(&insp, root, p) {
                Ok(c) => match c.value {
                    Ok(FieldValue::Reference(a)) => println!("{}: {}", c.name, summarize(&insp, a)),
                    Ok(v) => println!("{}: {}", c.name, v.format_with(flags)),
                    Err(e) => {
                        println!("{}: {}", c.name, e.marker());
                        eprintln!("error: {}", e);
                        failed = true;
                    }
                }
                Err(e) => {
                    println!("0x{:x}: {}", root, e.marker());
                    eprintln!("error: {}", e);
                    failed = true;
                }
            }
        } else {
            let mut printer = TreePrinter::new(&insp);
            printer.flags = flags;
            print!("{}", printer.print(root));
            for line in &printer.log.lines {
                eprintln!("warning: {}", line);
            }
            if printer.root_error.is_some() {
                failed = true;
            }
        }
    }
    if failed {
        process::exit(2);
    }
}
