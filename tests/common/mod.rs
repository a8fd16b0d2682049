#![allow(dead_code)]

use serde_json::Value;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub const BIN: &str = env!("CARGO_BIN_EXE_filepool");

pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// One request on a fresh connection; `None` if the connection failed or
/// closed before a full response.
pub fn request(port: u16, line: &str) -> Option<Value> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(10))).ok()?;
    stream.write_all(line.as_bytes()).ok()?;
    stream.write_all(b"\r\n\r\n").ok()?;

    let mut received = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        if let Some(end) = received.windows(4).position(|w| w == b"\r\n\r\n") {
            return serde_json::from_slice(&received[..end]).ok();
        }
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return None,
            Ok(n) => received.extend_from_slice(&chunk[..n]),
        }
    }
}

pub fn wait_until_serving(port: u16, child: &mut Child) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            panic!("server exited early with {status}");
        }
        if request(port, "LIST").is_some() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("server on port {port} never became ready");
}

/// A `filepool serve` child, interrupted and reaped on drop
pub struct ServeProcess {
    pub child: Child,
    pub port: u16,
}

impl ServeProcess {
    pub fn start(mode: &str, workers: usize, root: &Path) -> Self {
        let port = free_port();
        let mut child = Command::new(BIN)
            .args(["--log-level", "warn", "serve", "--host", "127.0.0.1"])
            .arg("--port")
            .arg(port.to_string())
            .arg("--mode")
            .arg(mode)
            .arg("--workers")
            .arg(workers.to_string())
            .arg("--root")
            .arg(root)
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        wait_until_serving(port, &mut child);
        Self { child, port }
    }

    pub fn interrupt(&mut self) -> std::process::ExitStatus {
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGINT);
        }
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            if Instant::now() > deadline {
                let _ = self.child.kill();
                return self.child.wait().unwrap();
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for ServeProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Child processes of `pid`, read from /proc
#[cfg(target_os = "linux")]
pub fn children_of(pid: u32) -> Vec<u32> {
    let mut children = Vec::new();
    for entry in std::fs::read_dir("/proc").unwrap().flatten() {
        let Ok(candidate) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{candidate}/stat")) else {
            continue;
        };
        // The command name is parenthesized and may contain spaces
        let Some(rest) = stat.rfind(')').map(|i| &stat[i + 1..]) else {
            continue;
        };
        let ppid = rest.split_whitespace().nth(1).and_then(|p| p.parse::<u32>().ok());
        if ppid == Some(pid) {
            children.push(candidate);
        }
    }
    children
}

/// True once `pid` no longer exists or is a zombie awaiting its reaper
#[cfg(target_os = "linux")]
pub fn is_gone(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return true;
    };
    let state = stat
        .rfind(')')
        .and_then(|i| stat[i + 1..].split_whitespace().next());
    state == Some("Z")
}
