//! `flypad-server status` — check if the server is running.
//! `flypad-server generate-token` — create a random auth token.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::paths;
use crate::VERSION;

pub fn run(data_dir: &Path) -> anyhow::Result<()> {
    println!();
    println!("  Flypad Server v{}", VERSION);
    println!("  Data dir: {}", data_dir.display());

    // Check PID file
    let pid_path = paths::pid_file_path();
    let (pid_alive, bind) = if pid_path.exists() {
        let content = std::fs::read_to_string(&pid_path).unwrap_or_default();
        let info: serde_json::Value = serde_json::from_str(&content).unwrap_or_default();
        let pid = info.get("pid").and_then(|p| p.as_u64()).unwrap_or(0) as u32;
        let bind = info
            .get("bind")
            .and_then(|b| b.as_str())
            .unwrap_or("127.0.0.1:4400")
            .to_string();
        if pid > 0 && process_alive(pid) {
            println!("  PID: {} (running)", pid);
            (true, bind)
        } else {
            println!("  PID file: {} (stale — process not found)", pid);
            (false, bind)
        }
    } else {
        println!("  PID file: not found");
        (false, "127.0.0.1:4400".to_string())
    };

    // Try HTTP health check
    let health_ok = check_health(&bind);
    if health_ok {
        println!("  Health: OK (http://{bind}/health)");
    } else if pid_alive {
        println!("  Health: unreachable (server may be binding to a different address)");
    } else {
        println!("  Health: unreachable");
    }

    // DB size
    let db_path = paths::db_path();
    if db_path.exists() {
        let size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
        println!("  Database: {} ({} KB)", db_path.display(), size / 1024);
    } else {
        println!("  Database: not found");
    }

    println!();

    if !pid_alive && !health_ok {
        println!("  Server is not running.");
        println!("  Start with: flypad-server start");
    }

    println!();
    Ok(())
}

pub fn generate_token(data_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(data_dir)?;

    let token_path = paths::token_file_path();
    // Force a fresh token even if one exists
    if token_path.exists() {
        std::fs::remove_file(&token_path)?;
    }
    let token = crate::pairing::load_or_generate_token(&token_path)?;
    std::fs::set_permissions(&token_path, std::fs::Permissions::from_mode(0o600))?;

    println!();
    println!(
        "  Auth token generated and saved to {}",
        token_path.display()
    );
    println!();
    println!("  Token: {}", token);
    println!();
    println!("  Usage:");
    println!("    flypad-server start --auth-token {}", token);
    println!("  Or:");
    println!(
        "    flypad-server start --auth-token $(cat {})",
        token_path.display()
    );
    println!();

    Ok(())
}

fn process_alive(pid: u32) -> bool {
    // kill -0 checks if process exists without sending a signal
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

fn check_health(bind: &str) -> bool {
    // Quick blocking check; runs outside tokio
    std::process::Command::new("curl")
        .args([
            "-s",
            "--connect-timeout",
            "1",
            "--max-time",
            "2",
            &format!("http://{bind}/health"),
        ])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
