//! Program and instance registry.
//!
//! Holds the registered program descriptors and, per program, the list of
//! live instances. Launching an instance assigns it the next free number
//! (`max(existing) + 1`, starting at 0) under the registry lock; the
//! instance removes itself when its main thread ends.
//!
//! # Usage
//!
//! ```rust,no_run
//! use seq_engine::prelude::*;
//! use seq_common::config::EngineConfig;
//! # fn program() -> ProgramDescriptor { unimplemented!() }
//! # fn pv_systems() -> PvSystemRegistry { unimplemented!() }
//!
//! let registry = Registry::new(EngineConfig::default(), pv_systems());
//! registry.register_program(program())?;
//! let handle = registry.start("demo", "unit=1", None)?;
//! handle.stop()?;
//! # Ok::<(), seq_engine::SeqError>(())
//! ```

use crate::error::{ProgramError, SeqError, SeqResult};
use crate::instance::{Instance, InstanceHandle, InstanceShared, run_instance};
use crate::program::ProgramDescriptor;
use crate::pv_registry::PvSystemRegistry;
use parking_lot::Mutex;
use seq_common::config::EngineConfig;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, info};

struct ProgramEntry {
    descriptor: Arc<ProgramDescriptor>,
    instances: Vec<Instance>,
}

/// Registered programs and their running instances.
pub struct Registry {
    config: EngineConfig,
    pv_systems: PvSystemRegistry,
    programs: Mutex<Vec<ProgramEntry>>,
}

impl Registry {
    pub fn new(config: EngineConfig, pv_systems: PvSystemRegistry) -> Arc<Self> {
        Arc::new(Self {
            config,
            pv_systems,
            programs: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pv_systems(&self) -> &PvSystemRegistry {
        &self.pv_systems
    }

    /// Make `descriptor` available to [`start`](Self::start).
    ///
    /// # Errors
    /// Returns `ProgramError::DuplicateProgram` if the name is taken.
    pub fn register_program(&self, descriptor: ProgramDescriptor) -> SeqResult<Arc<ProgramDescriptor>> {
        let mut programs = self.programs.lock();
        if programs.iter().any(|p| p.descriptor.name() == descriptor.name()) {
            return Err(ProgramError::DuplicateProgram(descriptor.name().to_string()).into());
        }
        let descriptor = Arc::new(descriptor);
        debug!(program = %descriptor.name(), "program registered");
        programs.push(ProgramEntry {
            descriptor: Arc::clone(&descriptor),
            instances: Vec::new(),
        });
        Ok(descriptor)
    }

    /// Registered program descriptors.
    pub fn programs(&self) -> Vec<Arc<ProgramDescriptor>> {
        self.programs
            .lock()
            .iter()
            .map(|p| Arc::clone(&p.descriptor))
            .collect()
    }

    pub fn find_program(&self, name: &str) -> Option<Arc<ProgramDescriptor>> {
        self.programs
            .lock()
            .iter()
            .find(|p| p.descriptor.name() == name)
            .map(|p| Arc::clone(&p.descriptor))
    }

    /// Launch a new instance of the registered program `name`.
    ///
    /// # Errors
    /// `SeqError::UnknownProgram` if nothing is registered under `name`,
    /// otherwise as [`launch`](Self::launch).
    pub fn start(
        self: &Arc<Self>,
        name: &str,
        macros: &str,
        stack_size: Option<usize>,
    ) -> SeqResult<InstanceHandle> {
        let descriptor = self
            .find_program(name)
            .ok_or_else(|| SeqError::UnknownProgram(name.to_string()))?;
        self.launch(descriptor, macros, stack_size)
    }

    /// Launch a new instance of `descriptor`, registering the program if
    /// it is not known yet.
    ///
    /// # Errors
    ///
    /// - `ProgramError::BadMagic` for an incompatible descriptor
    /// - `SeqError::UnknownPvSystem` if the PV system cannot be resolved
    /// - `SeqError::Spawn` if the main thread cannot be created
    pub fn launch(
        self: &Arc<Self>,
        descriptor: Arc<ProgramDescriptor>,
        macros: &str,
        stack_size: Option<usize>,
    ) -> SeqResult<InstanceHandle> {
        let prepared = InstanceShared::prepare(
            Arc::clone(&descriptor),
            macros,
            stack_size,
            &self.config,
            &self.pv_systems,
        )?;
        let shared = {
            let mut programs = self.programs.lock();
            let index = match programs
                .iter()
                .position(|p| p.descriptor.name() == descriptor.name())
            {
                Some(index) => index,
                None => {
                    programs.push(ProgramEntry {
                        descriptor: Arc::clone(&descriptor),
                        instances: Vec::new(),
                    });
                    programs.len() - 1
                }
            };
            let entry = &mut programs[index];
            let number = entry
                .instances
                .iter()
                .map(|i| i.instance_number() + 1)
                .max()
                .unwrap_or(0);
            let shared = Arc::new(prepared.numbered(number));
            entry.instances.push(Instance::new(Arc::clone(&shared)));
            shared
        };

        let instance = Instance::new(Arc::clone(&shared));
        let registry = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name(shared.thread_name.clone())
            .stack_size(shared.stack_size)
            .spawn(move || {
                run_instance(shared, |shared| {
                    if let Some(registry) = Weak::upgrade(&registry) {
                        registry.remove(&Instance::new(Arc::clone(shared)));
                    }
                });
            });

        match spawned {
            Ok(thread) => {
                info!(
                    program = %instance.program_name(),
                    instance = instance.instance_number(),
                    thread = %instance.thread_name(),
                    "instance launched"
                );
                Ok(InstanceHandle::new(instance, thread))
            }
            Err(e) => {
                self.remove(&instance);
                Err(SeqError::Spawn(e.to_string()))
            }
        }
    }

    /// Drop `instance` from its program's list.
    pub(crate) fn remove(&self, instance: &Instance) {
        let mut programs = self.programs.lock();
        for entry in programs.iter_mut() {
            entry.instances.retain(|i| !i.same_as(instance));
        }
    }

    /// Snapshot of all live instances, by program then instance number.
    pub fn instances(&self) -> Vec<Instance> {
        let programs = self.programs.lock();
        let mut all: Vec<Instance> = programs
            .iter()
            .flat_map(|p| p.instances.iter().cloned())
            .collect();
        all.sort_by_key(|i| (i.program_name().to_string(), i.instance_number()));
        all
    }

    /// Call `visit` for every live instance until it breaks.
    ///
    /// The registry lock is not held while `visit` runs.
    pub fn traverse<B>(&self, mut visit: impl FnMut(&Instance) -> ControlFlow<B>) -> Option<B> {
        for instance in self.instances() {
            if let ControlFlow::Break(b) = visit(&instance) {
                return Some(b);
            }
        }
        None
    }

    /// Instance `number` of program `name`.
    pub fn find(&self, name: &str, number: u32) -> Option<Instance> {
        self.traverse(|i| {
            if i.program_name() == name && i.instance_number() == number {
                ControlFlow::Break(i.clone())
            } else {
                ControlFlow::Continue(())
            }
        })
    }

    /// Instance running a state set on thread `id`.
    pub fn find_by_thread(&self, id: ThreadId) -> Option<Instance> {
        self.traverse(|i| {
            if i.thread_ids().contains(&id) {
                ControlFlow::Break(i.clone())
            } else {
                ControlFlow::Continue(())
            }
        })
    }

    /// Instance whose main thread is called `thread_name`.
    pub fn find_by_thread_name(&self, thread_name: &str) -> Option<Instance> {
        self.traverse(|i| {
            if i.thread_name() == thread_name {
                ControlFlow::Break(i.clone())
            } else {
                ControlFlow::Continue(())
            }
        })
    }

    /// Request exit of the instance running on thread `id`.
    ///
    /// # Errors
    /// Returns `SeqError::InstanceNotFound` if no state set runs on `id`.
    pub fn stop(&self, id: ThreadId) -> SeqResult<()> {
        let instance = self
            .find_by_thread(id)
            .ok_or_else(|| SeqError::InstanceNotFound(format!("{id:?}")))?;
        instance.request_exit();
        Ok(())
    }

    /// Request exit of instance `number` of program `name`.
    ///
    /// # Errors
    /// Returns `SeqError::InstanceNotFound` if there is no such instance.
    pub fn stop_instance(&self, name: &str, number: u32) -> SeqResult<()> {
        let instance = self
            .find(name, number)
            .ok_or_else(|| SeqError::InstanceNotFound(format!("{name}[{number}]")))?;
        instance.request_exit();
        Ok(())
    }

    /// Request exit of every live instance.
    pub fn stop_all(&self) {
        for instance in self.instances() {
            instance.request_exit();
        }
    }
}
