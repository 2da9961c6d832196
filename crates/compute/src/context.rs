use std::sync::Arc;
use std::time::Duration;

use cc_core::{ComputerConfig, ComputerLimits};

use crate::environment::GlobalEnvironment;
use crate::machine::MachineFactory;
use crate::main_thread::MainThread;
use crate::scheduler::ComputerThread;

/// Everything shared between the computers of one host: the two schedulers,
/// the machine factory and host-wide services.
///
/// Cheap to clone; every computer holds one.
#[derive(Clone)]
pub struct ComputerContext {
    global: Arc<dyn GlobalEnvironment>,
    scheduler: Arc<ComputerThread>,
    main_thread: Arc<MainThread>,
    machines: Arc<dyn MachineFactory>,
    limits: ComputerLimits,
}

impl ComputerContext {
    /// Build both schedulers from `config`. They share one metrics snapshot.
    pub fn new(
        global: Arc<dyn GlobalEnvironment>,
        machines: Arc<dyn MachineFactory>,
        config: &ComputerConfig,
    ) -> Self {
        let scheduler = ComputerThread::from_config(config);
        let main_thread = Arc::new(MainThread::with_metrics(
            &config.main_thread,
            scheduler.metrics_handle(),
        ));
        Self::with_schedulers(global, scheduler, main_thread, machines, config.computer.clone())
    }

    pub fn with_schedulers(
        global: Arc<dyn GlobalEnvironment>,
        scheduler: Arc<ComputerThread>,
        main_thread: Arc<MainThread>,
        machines: Arc<dyn MachineFactory>,
        limits: ComputerLimits,
    ) -> Self {
        Self {
            global,
            scheduler,
            main_thread,
            machines,
            limits,
        }
    }

    pub fn global(&self) -> &Arc<dyn GlobalEnvironment> {
        &self.global
    }

    pub fn scheduler(&self) -> &Arc<ComputerThread> {
        &self.scheduler
    }

    pub fn main_thread(&self) -> &Arc<MainThread> {
        &self.main_thread
    }

    pub fn machines(&self) -> &Arc<dyn MachineFactory> {
        &self.machines
    }

    pub fn limits(&self) -> &ComputerLimits {
        &self.limits
    }

    /// Stop the compute scheduler, waiting up to `timeout` for its workers.
    pub fn close(&self, timeout: Duration) -> bool {
        self.scheduler.stop(timeout)
    }
}
