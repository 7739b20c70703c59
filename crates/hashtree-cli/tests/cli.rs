//! End-to-end runs of the htree binary against a temporary repository
//!
//! Run with: cargo test --package hashtree-cli --test cli

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

struct Env {
    dir: TempDir,
}

impl Env {
    fn new(backend: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let config = format!(
            "[storage]\nbackend = \"{}\"\nmax_size_gb = 1\n\n[tree]\norder = 8\nchunk_size = 1024\n",
            backend
        );
        fs::create_dir_all(dir.path().join("config")).unwrap();
        fs::write(dir.path().join("config").join("config.toml"), config).unwrap();
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_htree"))
            .args(args)
            .arg("--data-dir")
            .arg(self.path().join("data"))
            .env("HTREE_CONFIG_DIR", self.path().join("config"))
            .env_remove("HTREE_DATA_DIR")
            .env_remove("RUST_LOG")
            .output()
            .unwrap()
    }

    fn ok(&self, args: &[&str]) -> String {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "htree {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8(output.stdout).unwrap()
    }

    fn write(&self, name: &str, data: &[u8]) -> String {
        let path = self.path().join(name);
        fs::write(&path, data).unwrap();
        path.to_string_lossy().to_string()
    }
}

fn exercise(backend: &str) {
    let env = Env::new(backend);
    let video: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 251) as u8).collect();
    let video_path = env.write("trip.mp4", &video);
    let notes_path = env.write("notes.txt", b"remember the milk");

    let out = env.ok(&["add", &video_path, "--key", "videos/trip.mp4"]);
    assert!(out.starts_with("added videos/trip.mp4 nhash1"), "{}", out);
    env.ok(&["add", &notes_path]);

    // separate invocations see the persisted root
    let out = env.ok(&["cat", "notes.txt"]);
    assert_eq!(out, "remember the milk");
    let out = env.run(&["cat", "videos/trip.mp4", "--offset", "5000", "--length", "100"]);
    assert!(out.status.success());
    assert_eq!(out.stdout, &video[5000..5100]);

    let out = env.ok(&["get", "videos/trip.mp4"]);
    let fields: Vec<&str> = out.trim().split('\t').collect();
    assert_eq!(fields[1], "file");
    assert_eq!(fields[2], "10000");

    // encoding the bare hash with the same header gives the same nhash
    let decoded = env.ok(&["nhash", fields[0]]);
    let hex = decoded.lines().next().unwrap().trim_start_matches("hash: ");
    let encoded = env.ok(&["nhash", hex, "--kind", "file", "--size", "10000"]);
    assert_eq!(encoded.trim(), fields[0]);

    // link the same content under a second key
    env.ok(&["set", "backup/trip.mp4", fields[0]]);
    let out = env.ok(&["ls"]);
    let keys: Vec<&str> = out.lines().map(|l| l.rsplit('\t').next().unwrap()).collect();
    assert_eq!(keys, vec!["backup/trip.mp4", "notes.txt", "videos/trip.mp4"]);
    let out = env.ok(&["ls", "--from", "n", "--to", "v"]);
    assert_eq!(out.lines().count(), 1);

    let out = env.ok(&["search", "trip"]);
    let paths: Vec<&str> = out.lines().map(|l| l.split('\t').nth(1).unwrap()).collect();
    assert_eq!(paths, vec!["backup/trip.mp4", "videos/trip.mp4"]);

    env.ok(&["rm", "backup/trip.mp4"]);
    assert!(!env.run(&["get", "backup/trip.mp4"]).status.success());
    assert!(!env.run(&["rm", "backup/trip.mp4"]).status.success());

    let log = env.ok(&["log"]);
    assert_eq!(log.lines().count(), 4);
    assert!(log.lines().last().unwrap().ends_with("(current)"));
    let status = env.ok(&["status"]);
    assert!(status.contains("Entries: 2"), "{}", status);
    assert!(status.contains("Mirror: not configured"));
}

#[test]
fn test_fs_backend_session() {
    exercise("fs");
}

#[test]
fn test_lmdb_backend_session() {
    exercise("lmdb");
}

#[test]
fn test_nhash_command() {
    let env = Env::new("fs");
    let hex = "ab".repeat(32);
    let encoded = env.ok(&["nhash", &hex, "--kind", "file", "--size", "4096"]);
    let encoded = encoded.trim();
    assert!(encoded.starts_with("nhash1"));

    let decoded = env.ok(&["nhash", encoded]);
    assert!(decoded.contains(&format!("hash: {}", hex)));
    assert!(decoded.contains("type: file"));
    assert!(decoded.contains("size: 4096"));

    assert!(!env.run(&["nhash", "nhash1qqqq"]).status.success());
    assert!(!env.run(&["nhash", "xyz"]).status.success());
}

#[test]
fn test_cat_hash_only_link() {
    let env = Env::new("fs");
    let notes_path = env.write("notes.txt", b"remember the milk");
    env.ok(&["add", &notes_path]);

    let out = env.ok(&["get", "notes.txt"]);
    let nhash = out.split('\t').next().unwrap();
    let decoded = env.ok(&["nhash", nhash]);
    let hex = decoded.lines().next().unwrap().trim_start_matches("hash: ");

    // no size in the header: the stored blob decides the length
    let bare = env.ok(&["nhash", hex]);
    env.ok(&["set", "bare", bare.trim()]);
    assert_eq!(env.ok(&["cat", "bare"]), "remember the milk");
    assert_eq!(env.ok(&["cat", "bare", "--offset", "9"]), "the milk");
}

#[test]
fn test_invalid_config_is_reported() {
    let env = Env::new("fs");
    fs::write(env.path().join("config").join("config.toml"), "[tree]\norder = 1\n").unwrap();
    let out = env.run(&["ls"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("tree.order"));
}
