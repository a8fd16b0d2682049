mod common;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use common::{request, ServeProcess, BIN};
use std::process::Command;

#[test]
fn test_process_pool_serves_list_upload_get() {
    let root = tempfile::tempdir().unwrap();
    let mut server = ServeProcess::start("process", 2, root.path());

    let listing = request(server.port, "LIST").unwrap();
    assert_eq!(listing["status"], "OK");
    assert_eq!(listing["data"], serde_json::json!([]));

    let encoded = STANDARD.encode(b"hello from a worker process");
    let upload = request(server.port, &format!("UPLOAD greeting.txt {encoded}")).unwrap();
    assert_eq!(upload["status"], "OK");
    assert_eq!(
        std::fs::read(root.path().join("greeting.txt")).unwrap(),
        b"hello from a worker process"
    );

    let get = request(server.port, "GET greeting.txt").unwrap();
    assert_eq!(get["status"], "OK");
    assert_eq!(get["data_namafile"], "greeting.txt");
    assert_eq!(get["data_file"], encoded.as_str());

    let missing = request(server.port, "GET nope.txt").unwrap();
    assert_eq!(missing["status"], "ERROR");

    let status = server.interrupt();
    assert!(status.success(), "server exited with {status}");
}

#[cfg(target_os = "linux")]
#[test]
fn test_process_pool_replaces_crashed_worker() {
    let root = tempfile::tempdir().unwrap();
    let server = ServeProcess::start("process", 2, root.path());

    let workers = common::children_of(server.child.id());
    assert_eq!(workers.len(), 2, "expected two worker processes, got {workers:?}");
    unsafe {
        libc::kill(workers[0] as libc::pid_t, libc::SIGKILL);
    }
    std::thread::sleep(std::time::Duration::from_millis(500));

    for _ in 0..6 {
        let listing = request(server.port, "LIST").unwrap();
        assert_eq!(listing["status"], "OK");
    }
}

#[test]
fn test_process_batch_against_thread_server() {
    let root = tempfile::tempdir().unwrap();
    let payloads = tempfile::tempdir().unwrap();
    let server = ServeProcess::start("thread", 4, root.path());

    let config = payloads.path().join("filepool.toml");
    std::fs::write(
        &config,
        r#"
        [client]
        timeout_secs = 30.0
        payloads = [{ key = "1MB", file = "one.bin", size_mb = 1 }]
        "#,
    )
    .unwrap();

    let output = Command::new(BIN)
        .arg("--config")
        .arg(&config)
        .args(["batch", "--action", "upload", "--payload", "1MB"])
        .args(["--workers", "2", "--ops", "4", "--mode", "process"])
        .arg("--port")
        .arg(server.port.to_string())
        .arg("--payload-dir")
        .arg(payloads.path())
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "batch failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    // The dummy payload was generated and uploaded
    let uploaded = std::fs::metadata(root.path().join("one.bin")).unwrap();
    assert_eq!(uploaded.len(), 1024 * 1024);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Batch finished"), "{stderr}");
}

#[test]
fn test_client_subcommands() {
    let root = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let server = ServeProcess::start("thread", 2, root.path());
    let port = server.port.to_string();

    let source = local.path().join("notes.txt");
    std::fs::write(&source, b"some notes").unwrap();

    let run = |args: &[&str]| {
        Command::new(BIN)
            .args(["--log-level", "warn", "client", "--port", &port])
            .args(args)
            .output()
            .unwrap()
    };

    let upload = run(&["upload", source.to_str().unwrap()]);
    assert!(upload.status.success());

    let list = run(&["list"]);
    assert!(String::from_utf8_lossy(&list.stdout).contains("notes.txt"));

    let out = tempfile::tempdir().unwrap();
    let get = run(&["get", "notes.txt", "--out", out.path().to_str().unwrap()]);
    assert!(get.status.success());
    assert_eq!(std::fs::read(out.path().join("notes.txt")).unwrap(), b"some notes");

    let delete = run(&["delete", "notes.txt"]);
    assert!(delete.status.success());
    assert!(!root.path().join("notes.txt").exists());

    let missing = run(&["delete", "notes.txt"]);
    assert!(!missing.status.success());
}
