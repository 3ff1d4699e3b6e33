//! Thin command-line front end: `version`, `demo`, `help`.

use std::process::ExitCode;

use burrow::{Config, Database};

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("version") => {
            println!("burrow {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Some("demo") => match run_demo() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("demo failed: {}", e);
                ExitCode::FAILURE
            }
        },
        Some("help") | None => {
            print_help();
            ExitCode::SUCCESS
        }
        Some(other) => {
            eprintln!("unknown command: {}", other);
            print_help();
            ExitCode::FAILURE
        }
    }
}

fn print_help() {
    println!("burrow - an embedded key-value storage engine");
    println!();
    println!("usage: burrow <command>");
    println!();
    println!("commands:");
    println!("  version    print the version and exit");
    println!("  demo       run a small end-to-end demonstration");
    println!("  help       show this help");
}

fn run_demo() -> burrow::Result<()> {
    let dir = std::env::temp_dir().join(format!("burrow-demo-{}", std::process::id()));
    std::fs::create_dir_all(&dir).map_err(|e| burrow::Error::io("create demo dir", e))?;
    let path = dir.join("demo.db");

    println!("opening {:?}", path);
    let db = Database::open(&path, Config::default())?;

    db.put(b"user:1", b"alice@example.com")?;
    db.put(b"user:2", b"bob@example.com")?;
    db.put(b"user:3", b"carol@example.com")?;
    println!("put 3 keys");

    let value = db.get(b"user:2")?;
    println!("get user:2 -> {}", String::from_utf8_lossy(&value));

    let txn = db.begin(Default::default())?;
    txn.put(b"user:4", b"dave@example.com")?;
    txn.commit()?;
    println!("committed a transaction");

    db.delete(b"user:3")?;
    println!("deleted user:3");

    print!("scan: ");
    let mut iter = db.iterator(None, None)?;
    while iter.valid() {
        print!("{} ", String::from_utf8_lossy(iter.key().unwrap()));
        iter.next();
    }
    println!();
    iter.close();

    let stats = db.stats()?;
    println!(
        "stats: {} keys, {} pages, {} active transactions",
        stats.key_count, stats.page_count, stats.txn_count
    );

    db.close()?;
    println!("closed cleanly");
    Ok(())
}
