// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tpm_manager::messages::*;
use tpm_manager::simulator::{Tpm1Simulator, Tpm2Simulator};
use tpm_manager::tpm20::{Tpm2Initializer, Tpm2Nvram};
use tpm_manager::{
    reply_channel, Backend, CommandError, DictionaryAttackInfo, FileSecretStore,
    LifecycleService, ManagerConfig, MemorySecretStore, ReplyCallback, SecretRecord, SecretStore,
    TpmGeneration, TpmNvramInterface, TpmOwnershipInterface, TpmStatus,
};

fn init_logs() {
    tracing_subscriber::fmt::try_init().ok();
}

/// Submit one request and wait for its reply, outside any runtime.
fn call<R: Send + 'static>(submit: impl FnOnce(ReplyCallback<R>)) -> R {
    let (tx, rx) = std::sync::mpsc::channel();
    submit(Box::new(move |reply: R| {
        tx.send(reply).ok();
    }));
    rx.recv_timeout(Duration::from_secs(10))
        .expect("no reply from the TPM worker")
}

fn config(wait_for_ownership: bool) -> ManagerConfig {
    ManagerConfig {
        wait_for_ownership,
        ..Default::default()
    }
}

fn tpm2_service(
    sim: &Tpm2Simulator,
    store: &Arc<MemorySecretStore>,
    config: &ManagerConfig,
) -> LifecycleService {
    init_logs();
    let backend = Backend::tpm2(
        sim.clone(),
        store.clone(),
        config.initial_owner_dependencies.clone(),
    );
    let service = LifecycleService::new(backend, config);
    service.initialize().unwrap();
    service
}

fn tpm1_service(sim: &Tpm1Simulator, store: &Arc<MemorySecretStore>) -> LifecycleService {
    init_logs();
    let config = ManagerConfig {
        generation: TpmGeneration::Tpm1,
        ..Default::default()
    };
    let backend = Backend::tpm1(
        sim.clone(),
        store.clone(),
        config.initial_owner_dependencies.clone(),
    );
    let service = LifecycleService::new(backend, &config);
    service.initialize().unwrap();
    service
}

fn status(service: &LifecycleService) -> GetTpmStatusReply {
    call(|cb| service.get_tpm_status(GetTpmStatusRequest {}, cb))
}

fn define(service: &LifecycleService, index: u32, length: u32) -> Status {
    call(|cb| service.define_nvram(DefineNvramRequest { index, length }, cb)).status
}

fn write(service: &LifecycleService, index: u32, data: &[u8]) -> Status {
    let request = WriteNvramRequest {
        index,
        data: data.to_vec(),
    };
    call(|cb| service.write_nvram(request, cb)).status
}

fn read(service: &LifecycleService, index: u32) -> ReadNvramReply {
    call(|cb| service.read_nvram(ReadNvramRequest { index }, cb))
}

fn remove_dependency(service: &LifecycleService, name: &str) -> Status {
    let request = RemoveOwnerDependencyRequest {
        owner_dependency: name.into(),
    };
    call(|cb| service.remove_owner_dependency(request, cb)).status
}

#[test]
fn startup_takes_ownership() {
    let sim = Tpm2Simulator::new();
    let store = Arc::new(MemorySecretStore::default());
    let service = tpm2_service(&sim, &store, &config(false));

    let reply = status(&service);
    assert_eq!(reply.status, Status::Success);
    assert!(reply.enabled);
    assert!(reply.owned);
    let record = reply.secret_record.unwrap();
    assert!(record.has_owner_password());
    assert!(record.owner_dependencies.contains("nvram"));
    assert!(record.owner_dependencies.contains("attestation"));
    assert_eq!(reply.dictionary_attack_counter, Some(0));
    assert_eq!(reply.dictionary_attack_lockout_in_effect, Some(false));
    assert_eq!(sim.owner_auth(), Some(record.owner_password.clone()));
}

#[test]
fn take_ownership_is_idempotent() {
    let sim = Tpm2Simulator::new();
    let store = Arc::new(MemorySecretStore::default());
    let service = tpm2_service(&sim, &store, &config(true));

    assert!(!status(&service).owned);
    assert_eq!(sim.take_ownership_calls(), 0);

    for _ in 0..3 {
        let reply = call(|cb| service.take_ownership(TakeOwnershipRequest {}, cb));
        assert_eq!(reply.status, Status::Success);
    }
    assert_eq!(sim.take_ownership_calls(), 1);
    assert!(status(&service).owned);
}

#[test]
fn nvram_define_write_read() {
    let sim = Tpm2Simulator::new();
    let store = Arc::new(MemorySecretStore::default());
    let service = tpm2_service(&sim, &store, &config(false));

    assert_eq!(define(&service, 5, 10), Status::Success);
    let defined = call(|cb| service.is_nvram_defined(IsNvramDefinedRequest { index: 5 }, cb));
    assert!(defined.is_defined);
    let size = call(|cb| service.get_nvram_size(GetNvramSizeRequest { index: 5 }, cb));
    assert_eq!(size.status, Status::Success);
    assert_eq!(size.size, 10);

    let unwritten = read(&service, 5);
    assert_eq!(unwritten.status, Status::UnexpectedDeviceError);
    assert!(unwritten.data.is_empty());
    let locked = call(|cb| service.is_nvram_locked(IsNvramLockedRequest { index: 5 }, cb));
    assert!(!locked.is_locked);

    assert_eq!(write(&service, 5, b"nvram_data"), Status::Success);
    let locked = call(|cb| service.is_nvram_locked(IsNvramLockedRequest { index: 5 }, cb));
    assert_eq!(locked.status, Status::Success);
    assert!(locked.is_locked);

    let reply = read(&service, 5);
    assert_eq!(reply.status, Status::Success);
    assert_eq!(reply.data, b"nvram_data");

    assert_eq!(write(&service, 5, b"nvram_data"), Status::UnexpectedDeviceError);
    assert_eq!(sim.open_sessions(), 0);
}

#[test]
fn destroy_nvram() {
    let sim = Tpm2Simulator::new();
    let store = Arc::new(MemorySecretStore::default());
    let service = tpm2_service(&sim, &store, &config(false));

    let reply = call(|cb| service.destroy_nvram(DestroyNvramRequest { index: 9 }, cb));
    assert_eq!(reply.status, Status::Success);

    assert_eq!(define(&service, 9, 16), Status::Success);
    let reply = call(|cb| service.destroy_nvram(DestroyNvramRequest { index: 9 }, cb));
    assert_eq!(reply.status, Status::Success);
    let defined = call(|cb| service.is_nvram_defined(IsNvramDefinedRequest { index: 9 }, cb));
    assert_eq!(defined.status, Status::Success);
    assert!(!defined.is_defined);
}

#[test]
fn nvram_needs_ownership() {
    let sim = Tpm2Simulator::new();
    let store = Arc::new(MemorySecretStore::default());
    let service = tpm2_service(&sim, &store, &config(true));

    assert_eq!(define(&service, 1, 8), Status::UnexpectedDeviceError);
    let size = call(|cb| service.get_nvram_size(GetNvramSizeRequest { index: 1 }, cb));
    assert_eq!(size.status, Status::UnexpectedDeviceError);
    assert_eq!(size.size, 0);
}

#[test]
fn removing_last_dependency_clears_passwords() {
    let sim = Tpm2Simulator::new();
    let mut record = SecretRecord::default();
    record.owner_password = b"owner".to_vec();
    record.endorsement_password = b"endorsement".to_vec();
    record.lockout_password = b"lockout".to_vec();
    record.owner_dependencies.insert("Test".into());
    let store = Arc::new(MemorySecretStore::new(record));
    let service = tpm2_service(&sim, &store, &config(true));

    assert_eq!(remove_dependency(&service, "Test"), Status::Success);
    let stored = store.read().unwrap();
    assert!(stored.owner_dependencies.is_empty());
    assert!(!stored.has_owner_password());
    assert!(!stored.has_endorsement_password());
    assert!(!stored.has_lockout_password());

    let reply = status(&service);
    assert!(!reply.secret_record.unwrap().has_owner_password());
}

#[test]
fn removing_one_dependency_keeps_passwords() {
    let sim = Tpm2Simulator::new();
    let store = Arc::new(MemorySecretStore::default());
    let service = tpm2_service(&sim, &store, &config(false));

    assert_eq!(remove_dependency(&service, "nvram"), Status::Success);
    assert_eq!(remove_dependency(&service, "unknown"), Status::Success);
    let stored = store.read().unwrap();
    assert_eq!(
        stored.owner_dependencies.iter().collect::<Vec<_>>(),
        ["attestation"]
    );
    assert!(stored.has_owner_password());

    // the owner password stays usable for the remaining consumers
    assert_eq!(define(&service, 3, 4), Status::Success);
}

#[test]
fn disabled_tpm_is_not_available() {
    let sim = Tpm2Simulator::new();
    sim.disable();
    let store = Arc::new(MemorySecretStore::default());
    let service = tpm2_service(&sim, &store, &config(false));

    let reply = status(&service);
    assert_eq!(reply.status, Status::Success);
    assert!(!reply.enabled);
    assert!(!reply.owned);
    assert!(reply.dictionary_attack_counter.is_none());
    assert_eq!(sim.take_ownership_calls(), 0);

    let reply = call(|cb| service.take_ownership(TakeOwnershipRequest {}, cb));
    assert_eq!(reply.status, Status::NotAvailable);
    assert_eq!(define(&service, 1, 8), Status::NotAvailable);
    assert_eq!(remove_dependency(&service, "nvram"), Status::NotAvailable);
    assert_eq!(sim.take_ownership_calls(), 0);
}

#[test]
fn unreachable_tpm_is_a_device_error() {
    let sim = Tpm2Simulator::new();
    sim.set_offline(true);
    let store = Arc::new(MemorySecretStore::default());
    let service = tpm2_service(&sim, &store, &config(true));

    assert_eq!(status(&service).status, Status::UnexpectedDeviceError);

    sim.set_offline(false);
    let reply = status(&service);
    assert_eq!(reply.status, Status::Success);
    assert!(reply.enabled);
}

#[test]
fn requests_before_initialize_run_in_order() {
    init_logs();
    let sim = Tpm2Simulator::new();
    let store = Arc::new(MemorySecretStore::default());
    let config = config(false);
    let backend = Backend::tpm2(sim.clone(), store.clone(), config.initial_owner_dependencies.clone());
    let service = LifecycleService::new(backend, &config);

    let (tx, rx) = std::sync::mpsc::channel();
    let tx2 = tx.clone();
    service.get_tpm_status(
        GetTpmStatusRequest {},
        Box::new(move |reply: GetTpmStatusReply| {
            tx.send(reply.owned).ok();
        }),
    );
    service.initialize().unwrap();
    service.get_tpm_status(
        GetTpmStatusRequest {},
        Box::new(move |reply: GetTpmStatusReply| {
            tx2.send(reply.owned).ok();
        }),
    );

    // the startup ownership attempt is queued behind the early request
    let timeout = Duration::from_secs(10);
    assert!(!rx.recv_timeout(timeout).unwrap());
    assert!(rx.recv_timeout(timeout).unwrap());
    assert!(service.initialize().is_err());
}

#[test]
fn crash_after_storing_passwords_recovers_them() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local_tpm_data");
    let file_store = FileSecretStore::new(&path);
    let mut record = SecretRecord::default();
    record.owner_password = b"persisted-owner".to_vec();
    record.endorsement_password = b"persisted-endorsement".to_vec();
    record.lockout_password = b"persisted-lockout".to_vec();
    record.owner_dependencies = ["nvram".to_string(), "attestation".to_string()].into();
    file_store.write(&record).unwrap();

    let sim = Tpm2Simulator::new();
    let config = ManagerConfig {
        secret_path: path.clone(),
        ..Default::default()
    };
    let backend = Backend::tpm2(
        sim.clone(),
        Arc::new(FileSecretStore::new(&path)),
        config.initial_owner_dependencies.clone(),
    );
    let service = LifecycleService::new(backend, &config);
    service.initialize().unwrap();

    assert!(status(&service).owned);
    assert_eq!(sim.owner_auth(), Some(b"persisted-owner".to_vec()));
    assert_eq!(file_store.read().unwrap(), record);
}

#[test]
fn transient_ownership_failures_are_retried() {
    let sim = Tpm2Simulator::new();
    sim.fail_take_ownership(vec![CommandError::Retry(0x922); 4]);
    let store = Arc::new(MemorySecretStore::default());
    let service = tpm2_service(&sim, &store, &config(true));

    let reply = call(|cb| service.take_ownership(TakeOwnershipRequest {}, cb));
    assert_eq!(reply.status, Status::Success);
    assert_eq!(sim.take_ownership_calls(), 5);

    let sim = Tpm2Simulator::new();
    sim.fail_take_ownership(vec![CommandError::Retry(0x922); 5]);
    let service = tpm2_service(&sim, &Arc::new(MemorySecretStore::default()), &config(true));
    let reply = call(|cb| service.take_ownership(TakeOwnershipRequest {}, cb));
    assert_eq!(reply.status, Status::UnexpectedDeviceError);
    assert_eq!(sim.take_ownership_calls(), 5);
}

#[test]
fn tpm1_backend() {
    init_logs();
    let sim = Tpm1Simulator::new();
    let store = Arc::new(MemorySecretStore::default());
    let config = ManagerConfig {
        generation: TpmGeneration::Tpm1,
        ..Default::default()
    };
    let backend = Backend::tpm1(sim.clone(), store.clone(), config.initial_owner_dependencies.clone());
    let service = LifecycleService::new(backend, &config);
    service.initialize().unwrap();

    let reply = status(&service);
    assert!(reply.owned);
    let record = reply.secret_record.unwrap();
    assert_eq!(sim.owner_auth(), Some(record.owner_password.clone()));
    assert!(!record.has_endorsement_password());

    assert_eq!(define(&service, 5, 10), Status::Success);
    assert_eq!(write(&service, 5, b"nvram_data"), Status::Success);
    assert_eq!(read(&service, 5).data, b"nvram_data");

    sim.extend_pcr0(b"developer mode");
    assert_eq!(read(&service, 5).status, Status::UnexpectedDeviceError);
}

/// Short and empty writes on both generations: the space is locked and a
/// read returns the full defined size with the device's fill bytes after
/// the written prefix.
fn assert_partial_writes(service: &LifecycleService, fill: u8) {
    assert_eq!(define(service, 5, 10), Status::Success);
    assert_eq!(write(service, 5, b"abcd"), Status::Success);
    let locked = call(|cb| service.is_nvram_locked(IsNvramLockedRequest { index: 5 }, cb));
    assert!(locked.is_locked);
    let reply = read(service, 5);
    assert_eq!(reply.status, Status::Success);
    assert_eq!(reply.data.len(), 10);
    assert_eq!(&reply.data[..4], b"abcd");
    assert!(reply.data[4..].iter().all(|b| *b == fill));
    assert_eq!(write(service, 5, b"efgh"), Status::UnexpectedDeviceError);

    assert_eq!(define(service, 6, 4), Status::Success);
    assert_eq!(write(service, 6, b""), Status::Success);
    let locked = call(|cb| service.is_nvram_locked(IsNvramLockedRequest { index: 6 }, cb));
    assert!(locked.is_locked);
    let reply = read(service, 6);
    assert_eq!(reply.status, Status::Success);
    assert_eq!(reply.data, vec![fill; 4]);
}

#[test]
fn tpm2_short_and_empty_writes() {
    let sim = Tpm2Simulator::new();
    let store = Arc::new(MemorySecretStore::default());
    let service = tpm2_service(&sim, &store, &config(false));
    assert_partial_writes(&service, 0x00);
}

#[test]
fn tpm1_short_and_empty_writes() {
    let sim = Tpm1Simulator::new();
    let store = Arc::new(MemorySecretStore::default());
    let service = tpm1_service(&sim, &store);
    assert_partial_writes(&service, 0xff);
}

#[test]
fn out_of_range_index_is_not_defined() {
    let sim = Tpm2Simulator::new();
    let store = Arc::new(MemorySecretStore::default());
    let service = tpm2_service(&sim, &store, &config(false));

    let reply = call(|cb| service.is_nvram_defined(IsNvramDefinedRequest { index: u32::MAX }, cb));
    assert_eq!(reply.status, Status::Success);
    assert!(!reply.is_defined);
    let reply = call(|cb| service.is_nvram_locked(IsNvramLockedRequest { index: u32::MAX }, cb));
    assert_eq!(reply.status, Status::Success);
    assert!(!reply.is_locked);
}

#[test]
fn panicking_callback_does_not_stop_the_worker() {
    let sim = Tpm2Simulator::new();
    let store = Arc::new(MemorySecretStore::default());
    let service = tpm2_service(&sim, &store, &config(false));

    service.get_tpm_status(
        GetTpmStatusRequest {},
        Box::new(|_: GetTpmStatusReply| panic!("callback failed")),
    );
    let reply = status(&service);
    assert_eq!(reply.status, Status::Success);
    assert!(reply.owned);
}

/// Status source whose every query panics.
struct BrokenStatus;

impl TpmStatus for BrokenStatus {
    fn is_enabled(&mut self) -> tpm_manager::Result<bool> {
        panic!("status query failed")
    }

    fn is_owned(&mut self) -> tpm_manager::Result<bool> {
        panic!("status query failed")
    }

    fn dictionary_attack_info(&mut self) -> tpm_manager::Result<DictionaryAttackInfo> {
        panic!("status query failed")
    }
}

#[test]
fn panicking_task_still_replies() {
    init_logs();
    let sim = Tpm2Simulator::new();
    let store: Arc<MemorySecretStore> = Arc::new(MemorySecretStore::default());
    let backend = Backend::new(
        Box::new(BrokenStatus),
        Box::new(Tpm2Initializer::new(sim.clone(), store.clone(), vec![])),
        Box::new(Tpm2Nvram::new(sim, store.clone())),
        store,
    );
    let service = LifecycleService::new(backend, &config(true));
    service.initialize().unwrap();

    for _ in 0..2 {
        assert_eq!(status(&service).status, Status::UnexpectedDeviceError);
        assert_eq!(define(&service, 1, 4), Status::UnexpectedDeviceError);
    }
}

#[test]
fn full_queue_rejects_without_blocking() {
    init_logs();
    let sim = Tpm2Simulator::new();
    let store = Arc::new(MemorySecretStore::default());
    let config = ManagerConfig {
        wait_for_ownership: true,
        queue_capacity: 2,
        ..Default::default()
    };
    let backend = Backend::tpm2(sim, store, config.initial_owner_dependencies.clone());
    let service = LifecycleService::new(backend, &config);

    let (tx, rx) = std::sync::mpsc::channel();
    for _ in 0..2 {
        let tx = tx.clone();
        service.get_tpm_status(
            GetTpmStatusRequest {},
            Box::new(move |reply: GetTpmStatusReply| {
                tx.send(reply.status).ok();
            }),
        );
    }
    // the worker is not running yet, so the queue stays full
    assert_eq!(status(&service).status, Status::UnexpectedDeviceError);
    assert!(rx.try_recv().is_err());

    service.initialize().unwrap();
    let timeout = Duration::from_secs(10);
    assert_eq!(rx.recv_timeout(timeout).unwrap(), Status::Success);
    assert_eq!(rx.recv_timeout(timeout).unwrap(), Status::Success);
    assert_eq!(status(&service).status, Status::Success);
}

#[test]
fn tpm1_from_config_needs_a_device() {
    let config = ManagerConfig {
        generation: TpmGeneration::Tpm1,
        ..Default::default()
    };
    assert!(LifecycleService::from_config(&config).is_err());
}

#[tokio::test]
async fn replies_arrive_on_the_callers_runtime() {
    let sim = Tpm2Simulator::new();
    let store = Arc::new(MemorySecretStore::default());
    let service = tpm2_service(&sim, &store, &config(false));

    let (callback, reply) = reply_channel();
    service.define_nvram(DefineNvramRequest { index: 2, length: 4 }, callback);
    assert_eq!(reply.await.unwrap().status, Status::Success);

    let (callback, reply) = reply_channel();
    service.write_nvram(
        WriteNvramRequest {
            index: 2,
            data: b"abcd".to_vec(),
        },
        callback,
    );
    assert_eq!(reply.await.unwrap().status, Status::Success);

    let (callback, reply) = reply_channel();
    service.read_nvram(ReadNvramRequest { index: 2 }, callback);
    assert_eq!(reply.await.unwrap().data, b"abcd");
}
