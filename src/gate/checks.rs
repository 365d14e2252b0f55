use std::time::Duration;
use tokio::net::TcpStream;

use crate::config::{CheckConfig, CheckKind};

use super::{CheckOutcome, CheckStatus};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) async fn run(check: CheckConfig, client: reqwest::Client) -> CheckOutcome {
    let (status, detail) = match check.kind {
        CheckKind::Env => env_check(&check.vars),
        CheckKind::Disk => match (&check.path, check.min_free_mb) {
            (Some(path), Some(min)) => disk_check(path, min).await,
            _ => misconfigured("path and min_free_mb"),
        },
        CheckKind::Tcp => match &check.addr {
            Some(addr) => tcp_check(addr).await,
            None => misconfigured("addr"),
        },
        CheckKind::Http => match &check.url {
            Some(url) => http_check(url, &client).await,
            None => misconfigured("url"),
        },
        CheckKind::Command => match &check.run {
            Some(run) => command_check(run).await,
            None => misconfigured("run"),
        },
    };

    // Advisory checks never block a deploy on their own.
    let status = match status {
        CheckStatus::Fail if check.advisory => CheckStatus::Warn,
        other => other,
    };

    CheckOutcome {
        name: check.name,
        status,
        detail,
    }
}

fn misconfigured(fields: &str) -> (CheckStatus, String) {
    (
        CheckStatus::Fail,
        format!("check is missing required field(s): {}", fields),
    )
}

fn env_check(vars: &[String]) -> (CheckStatus, String) {
    let missing: Vec<&str> = vars
        .iter()
        .filter(|v| std::env::var(v).is_err())
        .map(|v| v.as_str())
        .collect();

    if missing.is_empty() {
        (CheckStatus::Pass, format!("all {} variables set", vars.len()))
    } else {
        (
            CheckStatus::Fail,
            format!("missing: {}", missing.join(", ")),
        )
    }
}

/// Parses `df -Pk`: POSIX output format, available KB in the fourth column.
async fn disk_check(path: &str, min_free_mb: u64) -> (CheckStatus, String) {
    let output = match tokio::process::Command::new("df")
        .arg("-Pk")
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await
    {
        Ok(out) if out.status.success() => out,
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return (CheckStatus::Fail, format!("df failed: {}", stderr));
        }
        Err(e) => return (CheckStatus::Fail, format!("df failed: {}", e)),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let available_kb = stdout
        .lines()
        .nth(1)
        .and_then(|line| line.split_whitespace().nth(3))
        .and_then(|field| field.parse::<u64>().ok());

    match available_kb {
        Some(kb) => {
            let free_mb = kb / 1024;
            if free_mb < min_free_mb {
                (
                    CheckStatus::Fail,
                    format!("{} MB free, need {} MB", free_mb, min_free_mb),
                )
            } else if free_mb < min_free_mb * 2 {
                (
                    CheckStatus::Warn,
                    format!("{} MB free, approaching the {} MB floor", free_mb, min_free_mb),
                )
            } else {
                (CheckStatus::Pass, format!("{} MB free", free_mb))
            }
        }
        None => (
            CheckStatus::Fail,
            format!("could not parse df output for {}", path),
        ),
    }
}

async fn tcp_check(addr: &str) -> (CheckStatus, String) {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => (CheckStatus::Pass, format!("connected to {}", addr)),
        Ok(Err(e)) => (CheckStatus::Fail, format!("{}: {}", addr, e)),
        Err(_) => (
            CheckStatus::Fail,
            format!("{}: connect timed out after {}s", addr, CONNECT_TIMEOUT.as_secs()),
        ),
    }
}

async fn http_check(url: &str, client: &reqwest::Client) -> (CheckStatus, String) {
    match client.get(url).timeout(HTTP_TIMEOUT).send().await {
        Ok(resp) if resp.status().is_success() => {
            (CheckStatus::Pass, format!("HTTP {}", resp.status().as_u16()))
        }
        Ok(resp) => (CheckStatus::Fail, format!("HTTP {}", resp.status().as_u16())),
        Err(e) => (CheckStatus::Fail, e.to_string()),
    }
}

async fn command_check(run: &str) -> (CheckStatus, String) {
    match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(run)
        .kill_on_drop(true)
        .output()
        .await
    {
        Ok(out) if out.status.success() => (CheckStatus::Pass, "ok".to_string()),
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            let detail = if stderr.is_empty() {
                format!("exited with {}", out.status)
            } else {
                stderr
            };
            (CheckStatus::Fail, detail)
        }
        Err(e) => (CheckStatus::Fail, format!("failed to spawn: {}", e)),
    }
}
