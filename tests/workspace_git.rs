use std::path::{Path, PathBuf};
use std::process::Command;

use foreman::workspace::{GitWorkspaces, Reconciliation, SyncOutcome, Workspaces};

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?}: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A repo on `main` with one commit, pushed to a bare `origin`.
fn setup(root: &Path) -> PathBuf {
    let origin = root.join("origin.git");
    let repo = root.join("repo");
    std::fs::create_dir_all(&origin).unwrap();
    std::fs::create_dir_all(&repo).unwrap();
    git(&origin, &["init", "-q", "--bare", "-b", "main"]);
    git(&repo, &["init", "-q", "-b", "main"]);
    std::fs::write(repo.join("README.md"), "hello\n").unwrap();
    git(&repo, &["add", "README.md"]);
    git(&repo, &["commit", "-q", "-m", "init"]);
    git(&repo, &["remote", "add", "origin", &origin.to_string_lossy()]);
    git(&repo, &["push", "-q", "origin", "main"]);
    repo
}

fn workspaces(root: &Path, repo: &Path) -> GitWorkspaces {
    GitWorkspaces::new(repo.to_path_buf(), root.join("workers"), "main".into())
}

#[test]
fn worktree_lifecycle() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let repo = setup(root.path());
    let ws = workspaces(root.path(), &repo);

    let path = ws.ensure("worker-1").unwrap();
    assert_eq!(path, root.path().join("workers").join("worker-1"));
    assert!(path.join("README.md").exists());
    assert_eq!(ws.ensure("worker-1").unwrap(), path);

    ws.prepare_branch(&path, "bd-1").unwrap();
    assert_eq!(git(&path, &["rev-parse", "--abbrev-ref", "HEAD"]), "isolated/bd-1");
    assert_eq!(ws.sync_latest(&path), SyncOutcome::Synced);
    assert_eq!(ws.reconcile(&path).unwrap(), Reconciliation::Clean);

    ws.remove(&path).unwrap();
    assert!(!path.exists());
}

#[test]
fn reconcile_discards_minor_and_keeps_significant() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let repo = setup(root.path());
    let ws = workspaces(root.path(), &repo);
    let path = ws.ensure("worker-1").unwrap();
    ws.prepare_branch(&path, "bd-2").unwrap();

    std::fs::write(path.join("README.md"), "hello\nworld\n").unwrap();
    assert!(matches!(
        ws.reconcile(&path).unwrap(),
        Reconciliation::Minor { files: 1, .. }
    ));
    assert_eq!(std::fs::read_to_string(path.join("README.md")).unwrap(), "hello\n");

    let big: String = (0..30).map(|i| format!("line {i}\n")).collect();
    std::fs::write(path.join("README.md"), &big).unwrap();
    std::fs::write(path.join("new.txt"), "new\n").unwrap();
    let outcome = ws.reconcile(&path).unwrap();
    assert!(
        matches!(outcome, Reconciliation::Significant { files, .. } if files >= 2),
        "{outcome:?}"
    );
    assert_eq!(std::fs::read_to_string(path.join("README.md")).unwrap(), big);
    assert!(path.join("new.txt").exists());
}

#[test]
fn diverged_history_blocks_sync() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let repo = setup(root.path());
    let ws = workspaces(root.path(), &repo);
    let path = ws.ensure("worker-1").unwrap();
    ws.prepare_branch(&path, "bd-3").unwrap();

    std::fs::write(path.join("local.txt"), "local\n").unwrap();
    git(&path, &["add", "local.txt"]);
    git(&path, &["commit", "-q", "-m", "local work"]);

    std::fs::write(repo.join("upstream.txt"), "upstream\n").unwrap();
    git(&repo, &["add", "upstream.txt"]);
    git(&repo, &["commit", "-q", "-m", "upstream work"]);
    git(&repo, &["push", "-q", "origin", "main"]);

    assert!(matches!(ws.sync_latest(&path), SyncOutcome::Blocked(_)));
}

#[test]
fn missing_remote_is_nothing_to_sync() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let repo = root.path().join("solo");
    std::fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init", "-q", "-b", "main"]);
    std::fs::write(repo.join("a.txt"), "a\n").unwrap();
    git(&repo, &["add", "a.txt"]);
    git(&repo, &["commit", "-q", "-m", "init"]);

    let ws = workspaces(root.path(), &repo);
    let path = ws.ensure("worker-1").unwrap();
    ws.prepare_branch(&path, "bd-4").unwrap();
    assert_eq!(git(&path, &["rev-parse", "--abbrev-ref", "HEAD"]), "isolated/bd-4");
    assert_eq!(ws.sync_latest(&path), SyncOutcome::NothingToSync);
}

#[test]
fn untracked_directory_counts_every_file_and_line() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let repo = setup(root.path());
    let ws = workspaces(root.path(), &repo);
    let path = ws.ensure("worker-1").unwrap();
    ws.prepare_branch(&path, "bd-9").unwrap();

    let module = path.join("newmod");
    std::fs::create_dir_all(&module).unwrap();
    let body: String = (0..200).map(|i| format!("// line {i}\n")).collect();
    for i in 0..5 {
        std::fs::write(module.join(format!("f{i}.rs")), &body).unwrap();
    }

    assert_eq!(
        ws.reconcile(&path).unwrap(),
        Reconciliation::Significant { files: 5, lines: 1000 }
    );
    assert!(module.join("f4.rs").exists());
}

#[test]
fn small_untracked_file_is_minor_and_large_one_is_not() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let repo = setup(root.path());
    let ws = workspaces(root.path(), &repo);
    let path = ws.ensure("worker-1").unwrap();
    ws.prepare_branch(&path, "bd-10").unwrap();

    std::fs::create_dir_all(path.join("scratch")).unwrap();
    std::fs::write(path.join("scratch/notes.txt"), "one\ntwo\n").unwrap();
    assert_eq!(
        ws.reconcile(&path).unwrap(),
        Reconciliation::Minor { files: 1, lines: 2 }
    );
    assert!(!path.join("scratch/notes.txt").exists());

    let big: String = (0..25).map(|i| format!("{i}\n")).collect();
    std::fs::write(path.join("big.txt"), &big).unwrap();
    assert_eq!(
        ws.reconcile(&path).unwrap(),
        Reconciliation::Significant { files: 1, lines: 25 }
    );
    assert!(path.join("big.txt").exists());
}
