use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use parley_core::{Secret, ValidationFailure, ValidationStage};
use parley_engine::{
    passphrase_digest, DataDirPointer, EnvironmentLoader, PointerError, UserConfig,
    ValidationError, INSTANCE_LOCK_FILE,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

struct MemoryPointer(Mutex<PathBuf>);

impl MemoryPointer {
    fn new(dir: &Path) -> Arc<Self> {
        Arc::new(Self(Mutex::new(dir.to_path_buf())))
    }

    fn current(&self) -> PathBuf {
        self.0.lock().unwrap().clone()
    }
}

impl DataDirPointer for MemoryPointer {
    fn get(&self) -> Result<PathBuf, PointerError> {
        Ok(self.current())
    }

    fn set(&self, dir: &Path) -> Result<(), PointerError> {
        *self.0.lock().unwrap() = dir.to_path_buf();
        Ok(())
    }
}

struct Dirs {
    _temp: TempDir,
    current: PathBuf,
    target: PathBuf,
}

fn dirs() -> Dirs {
    let temp = TempDir::new().unwrap();
    let current = temp.path().join("a");
    let target = temp.path().join("b");
    fs::create_dir_all(&current).unwrap();
    fs::create_dir_all(&target).unwrap();
    Dirs {
        _temp: temp,
        current,
        target,
    }
}

fn loader(pointer: &Arc<MemoryPointer>) -> EnvironmentLoader {
    EnvironmentLoader::new(pointer.clone(), std::process::id())
}

fn protect(dir: &Path, passphrase: &str) {
    let config = UserConfig {
        passphrase_sha256: Some(passphrase_digest(&Secret::new(passphrase))),
        ..UserConfig::default()
    };
    config.save(dir).unwrap();
}

#[test]
fn valid_target_moves_the_pointer_and_takes_the_instance_lock() {
    let dirs = dirs();
    let pointer = MemoryPointer::new(&dirs.current);

    let environment = loader(&pointer).validate(&dirs.target, None).unwrap();

    assert_eq!(pointer.current(), dirs.target);
    assert_eq!(environment.data_dir, dirs.target);
    assert_eq!(environment.summary().default_model, "llama3");
    assert!(dirs.target.join("sessions").is_dir());
    assert!(dirs.target.join("plugins").is_dir());
    assert!(dirs.target.join(INSTANCE_LOCK_FILE).exists());

    drop(environment);
    assert!(!dirs.target.join(INSTANCE_LOCK_FILE).exists());
}

#[test]
fn broken_plugin_config_restores_the_pointer() {
    let dirs = dirs();
    fs::write(dirs.target.join("plugins.json"), "{ not json").unwrap();
    let pointer = MemoryPointer::new(&dirs.current);

    let err = loader(&pointer).validate(&dirs.target, None).unwrap_err();

    assert_eq!(pointer.current(), dirs.current);
    match err.to_failure() {
        ValidationFailure::Invalid { stage, .. } => assert_eq!(stage, ValidationStage::PluginConfig),
        other => panic!("unexpected failure: {other:?}"),
    }
    assert!(!dirs.target.join(INSTANCE_LOCK_FILE).exists());
}

#[test]
fn sessions_path_that_is_a_file_fails_session_storage() {
    let dirs = dirs();
    fs::write(dirs.target.join("sessions"), "x").unwrap();
    let pointer = MemoryPointer::new(&dirs.current);

    let err = loader(&pointer).validate(&dirs.target, None).unwrap_err();

    assert!(matches!(
        err,
        ValidationError::Stage {
            stage: ValidationStage::SessionStorage,
            ..
        }
    ));
    assert_eq!(pointer.current(), dirs.current);
}

#[test]
fn protected_target_asks_for_a_passphrase() {
    let dirs = dirs();
    protect(&dirs.target, "hunter2");
    let pointer = MemoryPointer::new(&dirs.current);
    let loader = loader(&pointer);

    let err = loader.validate(&dirs.target, None).unwrap_err();
    assert_eq!(err.to_failure(), ValidationFailure::PassphraseRequired);
    assert_eq!(pointer.current(), dirs.current);

    let err = loader
        .validate(&dirs.target, Some(&Secret::new("wrong")))
        .unwrap_err();
    assert_eq!(err.to_failure(), ValidationFailure::WrongPassphrase);
    assert_eq!(pointer.current(), dirs.current);

    let environment = loader
        .validate(&dirs.target, Some(&Secret::new("hunter2")))
        .unwrap();
    assert_eq!(environment.data_dir, dirs.target);
    assert_eq!(pointer.current(), dirs.target);
}

#[cfg(target_os = "linux")]
#[test]
fn instance_lock_held_elsewhere_rejects_the_target() {
    let dirs = dirs();
    fs::write(dirs.target.join(INSTANCE_LOCK_FILE), "1").unwrap();
    let pointer = MemoryPointer::new(&dirs.current);

    let err = loader(&pointer).validate(&dirs.target, None).unwrap_err();

    assert!(matches!(
        err,
        ValidationError::Stage {
            stage: ValidationStage::InstanceLock,
            ..
        }
    ));
    assert_eq!(pointer.current(), dirs.current);
}

#[test]
fn open_current_uses_the_pointer() {
    let dirs = dirs();
    let pointer = MemoryPointer::new(&dirs.current);
    let environment = loader(&pointer).open_current(None).unwrap();
    assert_eq!(environment.data_dir, dirs.current);
    assert_eq!(environment.instance_lock_path(), dirs.current.join(INSTANCE_LOCK_FILE));
}
