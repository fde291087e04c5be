// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! The lifecycle service: every TPM and secret-store operation runs on one
//! worker thread, in submission order, and answers through a callback.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::{ManagerConfig, TpmGeneration};
use crate::error::{Result, TpmManagerError};
use crate::hardware::{TpmInitializer, TpmNvram, TpmStatus};
use crate::messages::*;
use crate::secret_store::{FileSecretStore, SecretStore};
use crate::tpm12::{Tpm1Device, Tpm1Initializer, Tpm1Nvram, Tpm1Status};
use crate::tpm20::{SystemTpm2, Tpm2Device, Tpm2Initializer, Tpm2Nvram, Tpm2Status};

const WORKER_NAME: &str = "tpm-manager-worker";

pub type ReplyCallback<R> = Box<dyn FnOnce(R) + Send>;

type Task = Box<dyn FnOnce(&mut Backend) + Send>;

/// A callback paired with the receiver its reply arrives on.
pub fn reply_channel<R: Send + 'static>() -> (ReplyCallback<R>, oneshot::Receiver<R>) {
    let (tx, rx) = oneshot::channel();
    let callback = Box::new(move |reply: R| {
        if tx.send(reply).is_err() {
            debug!("reply receiver dropped");
        }
    });
    (callback, rx)
}

pub trait TpmOwnershipInterface {
    fn get_tpm_status(&self, request: GetTpmStatusRequest, callback: ReplyCallback<GetTpmStatusReply>);
    fn take_ownership(&self, request: TakeOwnershipRequest, callback: ReplyCallback<TakeOwnershipReply>);
    fn remove_owner_dependency(
        &self,
        request: RemoveOwnerDependencyRequest,
        callback: ReplyCallback<RemoveOwnerDependencyReply>,
    );
}

pub trait TpmNvramInterface {
    fn define_nvram(&self, request: DefineNvramRequest, callback: ReplyCallback<DefineNvramReply>);
    fn destroy_nvram(&self, request: DestroyNvramRequest, callback: ReplyCallback<DestroyNvramReply>);
    fn write_nvram(&self, request: WriteNvramRequest, callback: ReplyCallback<WriteNvramReply>);
    fn read_nvram(&self, request: ReadNvramRequest, callback: ReplyCallback<ReadNvramReply>);
    fn is_nvram_defined(
        &self,
        request: IsNvramDefinedRequest,
        callback: ReplyCallback<IsNvramDefinedReply>,
    );
    fn is_nvram_locked(
        &self,
        request: IsNvramLockedRequest,
        callback: ReplyCallback<IsNvramLockedReply>,
    );
    fn get_nvram_size(&self, request: GetNvramSizeRequest, callback: ReplyCallback<GetNvramSizeReply>);
}

/// One hardware generation's status, initializer and NVRAM, plus the
/// secret store they share. Owned by the worker once the service starts.
pub struct Backend {
    status: Box<dyn TpmStatus>,
    initializer: Box<dyn TpmInitializer>,
    nvram: Box<dyn TpmNvram>,
    store: Arc<dyn SecretStore>,
}

impl Backend {
    pub fn new(
        status: Box<dyn TpmStatus>,
        initializer: Box<dyn TpmInitializer>,
        nvram: Box<dyn TpmNvram>,
        store: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            status,
            initializer,
            nvram,
            store,
        }
    }

    pub fn tpm2<D>(device: D, store: Arc<dyn SecretStore>, initial_dependencies: Vec<String>) -> Self
    where
        D: Tpm2Device + Clone + 'static,
    {
        Self::new(
            Box::new(Tpm2Status::new(device.clone())),
            Box::new(Tpm2Initializer::new(
                device.clone(),
                store.clone(),
                initial_dependencies,
            )),
            Box::new(Tpm2Nvram::new(device, store.clone())),
            store,
        )
    }

    pub fn tpm1<D>(device: D, store: Arc<dyn SecretStore>, initial_dependencies: Vec<String>) -> Self
    where
        D: Tpm1Device + Clone + 'static,
    {
        Self::new(
            Box::new(Tpm1Status::new(device.clone())),
            Box::new(Tpm1Initializer::new(
                device.clone(),
                store.clone(),
                initial_dependencies,
            )),
            Box::new(Tpm1Nvram::new(device, store.clone())),
            store,
        )
    }

    fn ensure_enabled(&mut self) -> Result<()> {
        if self.status.is_enabled()? {
            Ok(())
        } else {
            Err(TpmManagerError::NotAvailable)
        }
    }

    fn initialize_ownership(&mut self) -> Result<()> {
        self.initializer.initialize_ownership(&mut *self.status)
    }

    fn startup_ownership(&mut self) {
        match self.status.is_enabled() {
            Ok(true) => {}
            Ok(false) => {
                warn!("TPM is disabled, not taking ownership");
                return;
            }
            Err(err) => {
                error!("failed to query TPM state: {err}");
                return;
            }
        }
        if let Err(err) = self.initialize_ownership() {
            error!("failed to initialize TPM ownership: {err}");
        }
    }

    fn get_tpm_status(&mut self) -> Result<GetTpmStatusReply> {
        let mut reply = GetTpmStatusReply {
            enabled: self.status.is_enabled()?,
            ..Default::default()
        };
        if !reply.enabled {
            return Ok(reply);
        }
        reply.owned = self.status.is_owned()?;
        match self.store.read() {
            Ok(record) => reply.secret_record = Some(record),
            Err(err) => warn!("failed to read secret record: {err}"),
        }
        match self.status.dictionary_attack_info() {
            Ok(da) => {
                reply.dictionary_attack_counter = Some(da.counter);
                reply.dictionary_attack_threshold = Some(da.threshold);
                reply.dictionary_attack_lockout_in_effect = Some(da.in_lockout);
                reply.dictionary_attack_lockout_seconds_remaining = Some(da.seconds_remaining);
            }
            Err(err) => warn!("failed to query dictionary attack state: {err}"),
        }
        Ok(reply)
    }

    fn take_ownership(&mut self) -> Result<TakeOwnershipReply> {
        self.ensure_enabled()?;
        self.initialize_ownership()?;
        Ok(TakeOwnershipReply::default())
    }

    fn remove_owner_dependency(&mut self, name: &str) -> Result<RemoveOwnerDependencyReply> {
        self.ensure_enabled()?;
        let mut record = self.store.read()?;
        if !record.remove_owner_dependency(name) {
            debug!(name, "owner dependency was not outstanding");
        }
        self.store.write(&record)?;
        if !record.has_owner_password() {
            info!("all owner dependencies removed, passwords cleared");
        }
        Ok(RemoveOwnerDependencyReply::default())
    }

    fn define_nvram(&mut self, request: &DefineNvramRequest) -> Result<DefineNvramReply> {
        self.ensure_enabled()?;
        self.nvram.define(request.index, request.length as usize)?;
        Ok(DefineNvramReply::default())
    }

    fn destroy_nvram(&mut self, request: &DestroyNvramRequest) -> Result<DestroyNvramReply> {
        self.ensure_enabled()?;
        self.nvram.destroy(request.index)?;
        Ok(DestroyNvramReply::default())
    }

    fn write_nvram(&mut self, request: &WriteNvramRequest) -> Result<WriteNvramReply> {
        self.ensure_enabled()?;
        self.nvram.write(request.index, &request.data)?;
        Ok(WriteNvramReply::default())
    }

    fn read_nvram(&mut self, request: &ReadNvramRequest) -> Result<ReadNvramReply> {
        self.ensure_enabled()?;
        Ok(ReadNvramReply {
            data: self.nvram.read(request.index)?,
            ..Default::default()
        })
    }

    fn is_nvram_defined(&mut self, request: &IsNvramDefinedRequest) -> Result<IsNvramDefinedReply> {
        self.ensure_enabled()?;
        Ok(IsNvramDefinedReply {
            is_defined: self.nvram.is_defined(request.index)?,
            ..Default::default()
        })
    }

    fn is_nvram_locked(&mut self, request: &IsNvramLockedRequest) -> Result<IsNvramLockedReply> {
        self.ensure_enabled()?;
        Ok(IsNvramLockedReply {
            is_locked: self.nvram.is_locked(request.index)?,
            ..Default::default()
        })
    }

    fn get_nvram_size(&mut self, request: &GetNvramSizeRequest) -> Result<GetNvramSizeReply> {
        self.ensure_enabled()?;
        let size = self.nvram.size(request.index)?;
        Ok(GetNvramSizeReply {
            size: u32::try_from(size)
                .map_err(|_| TpmManagerError::state(format!("NV size {size} out of range")))?,
            ..Default::default()
        })
    }
}

fn into_reply<R: Reply>(what: &str, result: Result<R>) -> R {
    result.unwrap_or_else(|err| {
        warn!("{what} failed: {err}");
        R::with_status(Status::from(&err))
    })
}

pub struct LifecycleService {
    sender: mpsc::Sender<Task>,
    pending: Mutex<Option<(mpsc::Receiver<Task>, Backend)>>,
    wait_for_ownership: bool,
}

impl LifecycleService {
    pub fn new(backend: Backend, config: &ManagerConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            sender,
            pending: Mutex::new(Some((receiver, backend))),
            wait_for_ownership: config.wait_for_ownership,
        }
    }

    /// Service over the system TPM 2.0 and the configured secret file.
    pub fn from_config(config: &ManagerConfig) -> Result<Self> {
        match config.generation {
            TpmGeneration::Tpm2 => {
                let store = Arc::new(FileSecretStore::new(&config.secret_path));
                let backend = Backend::tpm2(
                    SystemTpm2::new(config.device.clone()),
                    store,
                    config.initial_owner_dependencies.clone(),
                );
                Ok(Self::new(backend, config))
            }
            TpmGeneration::Tpm1 => Err(TpmManagerError::state(
                "TPM 1.2 needs a device supplied through Backend::tpm1",
            )),
        }
    }

    /// Start the worker. Requests submitted earlier run first.
    pub fn initialize(&self) -> Result<()> {
        let (mut receiver, mut backend) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TpmManagerError::state("service already initialized"))?;

        if !self.wait_for_ownership {
            if let Err(err) = self.sender.try_send(Box::new(Backend::startup_ownership)) {
                error!("failed to queue startup ownership attempt: {err}");
            }
        }
        std::thread::Builder::new()
            .name(WORKER_NAME.into())
            .spawn(move || {
                while let Some(task) = receiver.blocking_recv() {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| task(&mut backend)));
                    if let Err(panic) = result {
                        error!("TPM task panicked: {}", panic_message(&*panic));
                    }
                }
                debug!("TPM worker stopped");
            })
            .map_err(|e| TpmManagerError::device("failed to spawn TPM worker", e))?;
        info!(wait_for_ownership = self.wait_for_ownership, "TPM manager started");
        Ok(())
    }

    /// Run `task` on the worker, then hand its reply to `callback` on the
    /// caller's runtime if it has one, or on the worker otherwise. A full
    /// queue or a panicking task answers `UNEXPECTED_DEVICE_ERROR`.
    fn post_task_and_reply<R, F>(&self, task: F, callback: ReplyCallback<R>)
    where
        R: Reply,
        F: FnOnce(&mut Backend) -> R + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().ok();
        let permit = match self.sender.try_reserve() {
            Ok(permit) => permit,
            Err(err) => {
                warn!("rejecting TPM request: {err}");
                deliver(runtime, callback, R::with_status(Status::UnexpectedDeviceError));
                return;
            }
        };
        permit.send(Box::new(move |backend| {
            let reply = panic::catch_unwind(AssertUnwindSafe(|| task(backend))).unwrap_or_else(
                |panic| {
                    error!("TPM task panicked: {}", panic_message(&*panic));
                    R::with_status(Status::UnexpectedDeviceError)
                },
            );
            deliver(runtime, callback, reply);
        }));
    }
}

fn deliver<R: Send + 'static>(
    runtime: Option<tokio::runtime::Handle>,
    callback: ReplyCallback<R>,
    reply: R,
) {
    match runtime {
        Some(handle) => {
            handle.spawn(async move { callback(reply) });
        }
        None => callback(reply),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

impl TpmOwnershipInterface for LifecycleService {
    fn get_tpm_status(&self, _: GetTpmStatusRequest, callback: ReplyCallback<GetTpmStatusReply>) {
        self.post_task_and_reply(
            |backend| into_reply("GetTpmStatus", backend.get_tpm_status()),
            callback,
        );
    }

    fn take_ownership(&self, _: TakeOwnershipRequest, callback: ReplyCallback<TakeOwnershipReply>) {
        self.post_task_and_reply(
            |backend| into_reply("TakeOwnership", backend.take_ownership()),
            callback,
        );
    }

    fn remove_owner_dependency(
        &self,
        request: RemoveOwnerDependencyRequest,
        callback: ReplyCallback<RemoveOwnerDependencyReply>,
    ) {
        self.post_task_and_reply(
            move |backend| {
                into_reply(
                    "RemoveOwnerDependency",
                    backend.remove_owner_dependency(&request.owner_dependency),
                )
            },
            callback,
        );
    }
}

impl TpmNvramInterface for LifecycleService {
    fn define_nvram(&self, request: DefineNvramRequest, callback: ReplyCallback<DefineNvramReply>) {
        self.post_task_and_reply(
            move |backend| into_reply("DefineNvram", backend.define_nvram(&request)),
            callback,
        );
    }

    fn destroy_nvram(&self, request: DestroyNvramRequest, callback: ReplyCallback<DestroyNvramReply>) {
        self.post_task_and_reply(
            move |backend| into_reply("DestroyNvram", backend.destroy_nvram(&request)),
            callback,
        );
    }

    fn write_nvram(&self, request: WriteNvramRequest, callback: ReplyCallback<WriteNvramReply>) {
        self.post_task_and_reply(
            move |backend| into_reply("WriteNvram", backend.write_nvram(&request)),
            callback,
        );
    }

    fn read_nvram(&self, request: ReadNvramRequest, callback: ReplyCallback<ReadNvramReply>) {
        self.post_task_and_reply(
            move |backend| into_reply("ReadNvram", backend.read_nvram(&request)),
            callback,
        );
    }

    fn is_nvram_defined(
        &self,
        request: IsNvramDefinedRequest,
        callback: ReplyCallback<IsNvramDefinedReply>,
    ) {
        self.post_task_and_reply(
            move |backend| into_reply("IsNvramDefined", backend.is_nvram_defined(&request)),
            callback,
        );
    }

    fn is_nvram_locked(
        &self,
        request: IsNvramLockedRequest,
        callback: ReplyCallback<IsNvramLockedReply>,
    ) {
        self.post_task_and_reply(
            move |backend| into_reply("IsNvramLocked", backend.is_nvram_locked(&request)),
            callback,
        );
    }

    fn get_nvram_size(&self, request: GetNvramSizeRequest, callback: ReplyCallback<GetNvramSizeReply>) {
        self.post_task_and_reply(
            move |backend| into_reply("GetNvramSize", backend.get_nvram_size(&request)),
            callback,
        );
    }
}
