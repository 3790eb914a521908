use std::fs;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use tempfile::TempDir;

use kira_genome_registry::cancel::CancelToken;
use kira_genome_registry::config::RegistryConfig;
use kira_genome_registry::error::RegistryError;
use kira_genome_registry::lock::{FileLock, LockMode, lock_path_for};
use kira_genome_registry::registry::Registry;

fn lock_path(temp: &TempDir) -> Utf8PathBuf {
    lock_path_for(&Utf8PathBuf::from_path_buf(temp.path().join("registry.json")).unwrap())
}

#[test]
fn exclusive_holder_blocks_other_handles() {
    let temp = TempDir::new().unwrap();
    let first = FileLock::new(lock_path(&temp));
    let second = FileLock::new(lock_path(&temp));

    let guard = first
        .acquire(LockMode::Exclusive, Duration::from_secs(1), None)
        .unwrap();
    assert_matches!(
        second.acquire(LockMode::Shared, Duration::from_millis(120), None),
        Err(RegistryError::LockTimeout { .. })
    );

    drop(guard);
    assert_eq!(first.depth(), 0);
    let shared = second
        .acquire(LockMode::Shared, Duration::from_secs(1), None)
        .unwrap();
    assert_eq!(shared.mode(), LockMode::Shared);
}

#[test]
fn shared_holders_coexist() {
    let temp = TempDir::new().unwrap();
    let first = FileLock::new(lock_path(&temp));
    let second = FileLock::new(lock_path(&temp));

    let _a = first
        .acquire(LockMode::Shared, Duration::from_secs(1), None)
        .unwrap();
    let _b = second
        .acquire(LockMode::Shared, Duration::from_secs(1), None)
        .unwrap();
    assert_matches!(
        second.acquire(LockMode::Exclusive, Duration::from_millis(50), None),
        Err(RegistryError::LockUpgrade(_))
    );
}

#[test]
fn cancelled_waiter_gives_up() {
    let temp = TempDir::new().unwrap();
    let holder = FileLock::new(lock_path(&temp));
    let waiter = FileLock::new(lock_path(&temp));
    let _guard = holder
        .acquire(LockMode::Exclusive, Duration::from_secs(1), None)
        .unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    assert_matches!(
        waiter.acquire(LockMode::Exclusive, Duration::from_secs(30), Some(&cancel)),
        Err(RegistryError::Cancelled(_))
    );
}

#[test]
fn mutation_waits_for_a_foreign_writer() {
    let temp = TempDir::new().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("registry.json")).unwrap();
    let config = RegistryConfig::new(path.clone()).with_lock_timeout(Duration::from_millis(150));
    let mut registry = Registry::initialize(config, Vec::new()).unwrap();
    let before = std::fs::read(path.as_std_path()).unwrap();

    let foreign = FileLock::for_registry(&path);
    let _guard = foreign
        .acquire(LockMode::Exclusive, Duration::from_secs(1), None)
        .unwrap();
    assert_matches!(
        registry.set_alias("d1", &["hg38".to_string()], false),
        Err(RegistryError::LockTimeout { .. })
    );
    assert_eq!(std::fs::read(path.as_std_path()).unwrap(), before);
}

const HOLDER_ENV: &str = "KIRA_GR_LOCK_HOLDER";

/// Child side of `writer_in_another_process_blocks_mutation`. Does nothing
/// unless started by it.
#[test]
fn hold_registry_lock_until_released() {
    let Ok(dir) = std::env::var(HOLDER_ENV) else {
        return;
    };
    let dir = Utf8PathBuf::from(dir);
    let lock = FileLock::for_registry(&dir.join("registry.json"));
    let _guard = lock
        .acquire(LockMode::Exclusive, Duration::from_secs(5), None)
        .unwrap();
    fs::write(dir.join("held").as_std_path(), b"").unwrap();
    let deadline = Instant::now() + Duration::from_secs(30);
    while !dir.join("release").as_std_path().exists() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn writer_in_another_process_blocks_mutation() {
    let temp = TempDir::new().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let config = RegistryConfig::new(dir.join("registry.json"))
        .with_lock_timeout(Duration::from_millis(200));
    let mut registry = Registry::initialize(config, Vec::new()).unwrap();

    let mut child = Command::new(std::env::current_exe().unwrap())
        .args(["hold_registry_lock_until_released", "--exact", "--nocapture"])
        .env(HOLDER_ENV, dir.as_str())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(20);
    while !dir.join("held").as_std_path().exists() {
        assert!(child.try_wait().unwrap().is_none(), "lock holder exited early");
        assert!(Instant::now() < deadline, "lock holder never took the lock");
        thread::sleep(Duration::from_millis(20));
    }

    assert_matches!(
        registry.set_alias("d1", &["hg38".to_string()], false),
        Err(RegistryError::LockTimeout { .. })
    );
    assert_matches!(registry.resolve_alias("hg38"), Err(RegistryError::MissingCollection(_)));

    fs::write(dir.join("release").as_std_path(), b"").unwrap();
    assert!(child.wait().unwrap().success());
    registry.set_alias("d1", &["hg38".to_string()], false).unwrap();
    assert_eq!(registry.resolve_alias("hg38").unwrap(), "d1");
}
