//! Environment diagnostics for the gateway host.

use clawgate_core::{probe_target, LockFile};
use std::process::Command;

pub async fn run() -> anyhow::Result<()> {
    println!("🏥 Clawgate Doctor\n");

    let config = crate::server::load_config()?;
    let mut all_ok = true;

    all_ok &= check_worker_binary(&config);
    all_ok &= check_data_dir(&config);
    check_lock_file(&config);
    check_worker_port(&config).await;
    all_ok &= check_token(&config);

    println!();
    if all_ok {
        println!("✅ All checks passed! Ready to run clawgate.");
    } else {
        println!("⚠️  Some checks failed. Please fix the issues above.");
        std::process::exit(1);
    }

    Ok(())
}

fn check_worker_binary(config: &crate::server::AppConfig) -> bool {
    print!("Checking worker binary... ");

    let bin = &config.worker.bin;
    let found = if bin.contains('/') {
        std::path::Path::new(bin).is_file()
    } else {
        Command::new("which")
            .arg(bin)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    };

    if found {
        println!("✅ {bin}");
        true
    } else {
        println!("❌ '{bin}' not found on this host");
        println!("  Install the worker or set CLAWGATE_WORKER__BIN");
        false
    }
}

fn check_data_dir(config: &crate::server::AppConfig) -> bool {
    print!("Checking worker data directory... ");

    let dir = config.worker.data_path();
    if dir.exists() {
        println!("✅ {}", dir.display());
        true
    } else {
        println!("ℹ️  Will create {}", dir.display());
        true
    }
}

fn check_lock_file(config: &crate::server::AppConfig) {
    print!("Checking worker lock... ");

    let lock = LockFile::new(config.worker.data_path().join("worker.lock"));
    match lock.owner() {
        Some(pid) if clawgate_core::lock::pid_alive(pid) => {
            println!("⚠️  Held by live process {pid} (will be reclaimed at startup)");
        }
        Some(pid) => println!("ℹ️  Stale lock from dead process {pid} (will be removed)"),
        None => println!("✅ None"),
    }
}

async fn check_worker_port(config: &crate::server::AppConfig) {
    print!("Checking worker port... ");

    let target = config.worker.target();
    if probe_target(target).await {
        println!("ℹ️  {target} already accepts connections (existing worker?)");
    } else {
        println!("✅ {target} is free");
    }
}

fn check_token(config: &crate::server::AppConfig) -> bool {
    print!("Checking admin token... ");

    match &config.server.auth_token {
        Some(token) if token.len() >= 16 => {
            println!("✅ Configured");
            true
        }
        Some(_) => {
            println!("⚠️  Configured but short (16+ characters recommended)");
            true
        }
        None => {
            println!("❌ Not set");
            println!("  Set CLAWGATE_SERVER__AUTH_TOKEN or server.auth_token in config");
            false
        }
    }
}
