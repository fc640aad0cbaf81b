// Property tests for lock ownership

mod common;

use appliance_backup::lock::{LockManager, LockMarker};
use appliance_backup::BackupError;
use common::FakeProbe;
use proptest::prelude::*;
use std::fs;
use std::sync::Arc;

fn snapshot_id() -> impl Strategy<Value = String> {
    (0u32..24, 0u32..60, 0u32..60)
        .prop_map(|(h, m, s)| format!("20240309T{:02}{:02}{:02}", h, m, s))
}

proptest! {
    #[test]
    fn release_only_removes_the_owners_marker(
        id in snapshot_id(),
        other_id in snapshot_id(),
        owner_pid in 1u32..100_000,
        other_pid in 1u32..100_000,
    ) {
        prop_assume!(id != other_id || owner_pid != other_pid);
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), Arc::new(FakeProbe::default()));
        let owner = LockMarker::new(id, owner_pid);
        locks.acquire(&owner).unwrap();

        prop_assert!(!locks.release(&LockMarker::new(other_id, other_pid)).unwrap());
        prop_assert_eq!(locks.read().unwrap(), Some(owner.clone()));

        prop_assert!(locks.release(&owner).unwrap());
        prop_assert!(!locks.path().exists());
        prop_assert!(!locks.release(&owner).unwrap());
    }

    #[test]
    fn live_holder_always_wins(
        id in snapshot_id(),
        holder_pid in 1u32..100_000,
        contender_pid in 1u32..100_000,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), Arc::new(FakeProbe::alive(&[holder_pid])));
        let holder = LockMarker::new(id.clone(), holder_pid);
        locks.acquire(&holder).unwrap();

        let conflict = locks.acquire(&LockMarker::new(id, contender_pid));
        let is_conflict =
            matches!(conflict, Err(BackupError::LockConflict { pid, .. }) if pid == holder_pid);
        prop_assert!(is_conflict);
        prop_assert_eq!(locks.read().unwrap(), Some(holder));
    }

    #[test]
    fn unparsable_markers_are_fatal_and_left_alone(contents in "[a-z]{1,12}|[a-z]{1,6} [a-z]{1,6}|[0-9]{1,4} [0-9]{1,4} [0-9]{1,4}") {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(dir.path(), Arc::new(FakeProbe::default()));
        fs::write(locks.path(), &contents).unwrap();

        let result = locks.acquire(&LockMarker::new("20240309T120000", 1));
        let is_malformed = matches!(result, Err(BackupError::MalformedLock { .. }));
        prop_assert!(is_malformed);
        prop_assert_eq!(fs::read_to_string(locks.path()).unwrap(), contents);
        prop_assert!(!locks.release(&LockMarker::new("20240309T120000", 1)).unwrap());
    }
}
