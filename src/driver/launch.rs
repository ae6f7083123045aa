//! Launches the single, persistent Chrome process the page manager's browser context is
//! bound to. Grounded on the launch-argument idiom used for per-profile Chrome processes,
//! pared down to what one persistent context needs (no per-profile pool, no fingerprint
//! spoofing, no custom-arg injection).

use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::{Result, ServiceError};

static CDP_PORT_COUNTER: AtomicU16 = AtomicU16::new(9222);

/// Allocate the next candidate CDP remote-debugging port. Starts at 9222 and increments;
/// wraps around at 65500. A caller that finds a port in use should call again.
pub fn allocate_cdp_port() -> u16 {
    let port = CDP_PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
    if port > 65500 {
        CDP_PORT_COUNTER.store(9222, Ordering::SeqCst);
        return 9222;
    }
    port
}

/// Default Chrome executable path per platform, overridable by a caller-supplied path.
pub fn default_chrome_path() -> PathBuf {
    if let Ok(p) = std::env::var("CHROME_PATH") {
        return PathBuf::from(p);
    }
    #[cfg(target_os = "macos")]
    {
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome")
    }
    #[cfg(target_os = "windows")]
    {
        PathBuf::from("C:\\Program Files\\Google\\Chrome\\Application\\chrome.exe")
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        PathBuf::from("/usr/bin/google-chrome")
    }
}

/// Build the Chrome launch command for the persistent browser context.
pub fn build_command(
    chrome_path: &Path,
    cdp_port: u16,
    user_data_dir: &Path,
    headless: bool,
) -> Command {
    let mut cmd = Command::new(chrome_path);
    cmd.arg(format!("--remote-debugging-port={cdp_port}"));
    cmd.arg(format!("--user-data-dir={}", user_data_dir.display()));
    cmd.arg("--no-first-run");
    cmd.arg("--no-default-browser-check");
    cmd.arg("--disable-blink-features=AutomationControlled");
    cmd.arg("--disable-extensions");
    cmd.arg("--disable-popup-blocking");
    if headless {
        cmd.arg("--headless=new");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    cmd
}

/// Launch Chrome and poll its devtools HTTP endpoint until it is reachable.
pub async fn launch_and_wait(
    chrome_path: &Path,
    user_data_dir: &Path,
    headless: bool,
) -> Result<(Child, u16)> {
    std::fs::create_dir_all(user_data_dir)?;

    let mut last_err = None;
    for _ in 0..5 {
        let port = allocate_cdp_port();
        let mut cmd = build_command(chrome_path, port, user_data_dir, headless);
        match cmd.spawn() {
            Ok(child) => {
                match super::cdp::wait_for_devtools_ready(port, 10_000).await {
                    Ok(()) => return Ok((child, port)),
                    Err(e) => {
                        last_err = Some(e);
                        continue;
                    }
                }
            }
            Err(e) => {
                last_err = Some(ServiceError::DriverGone(format!(
                    "failed to spawn chrome at {}: {e}",
                    chrome_path.display()
                )));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ServiceError::DriverGone("chrome never started".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_command_sets_required_flags() {
        let cmd = build_command(
            Path::new("/usr/bin/google-chrome"),
            9321,
            Path::new("/tmp/simplepage-profile"),
            true,
        );
        let args: Vec<String> = cmd
            .get_args()
            .map(|s| s.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"--remote-debugging-port=9321".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/simplepage-profile".to_string()));
        assert!(args.iter().any(|a| a.starts_with("--headless")));
    }

    #[test]
    fn headless_flag_omitted_when_disabled() {
        let cmd = build_command(
            Path::new("/usr/bin/google-chrome"),
            9322,
            Path::new("/tmp/simplepage-profile"),
            false,
        );
        let args: Vec<String> = cmd
            .get_args()
            .map(|s| s.to_string_lossy().to_string())
            .collect();
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
    }

    #[test]
    fn port_allocation_increments() {
        let p1 = allocate_cdp_port();
        let p2 = allocate_cdp_port();
        assert_eq!(p2, p1 + 1);
    }
}
