use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, error, info};

use cc_core::{Colour, FileSystem, WritableMount};

use crate::machine::{Machine, MachineContext};
use crate::sync::{lock, read};

use super::ComputerExecutor;

impl ComputerExecutor {
    /// Bring the computer up. Any failure is shown on the terminal and the
    /// computer is shut straight back down.
    pub(super) fn turn_on(&self) {
        {
            let guard = lock(&self.is_on_lock);
            self.env.terminal().reset();
            lock(&self.queue).events.clear();

            let Some(filesystem) = self.create_filesystem() else {
                drop(guard);
                self.shutdown();
                return;
            };
            *lock(&self.filesystem) = Some(filesystem);

            self.env.reset();
            for api in read(&self.apis).iter() {
                api.startup();
            }

            let Some(machine) = self.create_machine() else {
                drop(guard);
                self.shutdown();
                return;
            };
            *lock(&self.machine) = Some(machine);

            self.is_on.store(true, Ordering::Release);
        }

        info!(computer = self.env.id(), "Computer turned on");

        // Run the boot program straight away.
        self.was_paused.store(true, Ordering::Release);
        self.handle.timeout().stop_timer();
    }

    /// Tear everything down. Safe to repeat, and to race with an abort.
    pub(super) fn shutdown(&self) {
        let _guard = lock(&self.is_on_lock);

        let was_on = self.is_on.swap(false, Ordering::AcqRel);
        self.was_paused.store(false, Ordering::Release);
        lock(&self.queue).events.clear();

        let machine = lock(&self.machine).take();
        if let Some(machine) = machine {
            machine.close();
        }

        for api in read(&self.apis).iter() {
            api.shutdown();
        }
        self.env.reset();

        let filesystem = lock(&self.filesystem).take();
        if let Some(filesystem) = filesystem {
            let mounts = filesystem.close();
            debug!(computer = self.env.id(), mounts, "Unmounted filesystem");
        }

        self.env.reset_output();

        if was_on {
            info!(computer = self.env.id(), "Computer shut down");
        }
    }

    fn root_mount(&self) -> Option<Arc<dyn WritableMount>> {
        let mut cached = lock(&self.root_mount);
        if cached.is_none() {
            *cached = self.env.computer().create_root_mount();
        }
        cached.clone()
    }

    fn create_filesystem(&self) -> Option<FileSystem> {
        let Some(root) = self.root_mount() else {
            self.display_failure("Cannot mount computer mount", None);
            return None;
        };

        let mut filesystem = FileSystem::new("hdd", root);

        let Some(rom) = self.env.global().rom_mount() else {
            self.display_failure("Cannot mount ROM", None);
            return None;
        };

        if let Err(e) = filesystem.mount("rom", "rom", rom) {
            filesystem.close();
            error!(computer = self.env.id(), "Cannot mount computer filesystem: {}", e);
            self.display_failure("Cannot mount computer system", None);
            return None;
        }

        Some(filesystem)
    }

    fn create_machine(&self) -> Option<Arc<dyn Machine>> {
        let bios = match self.env.global().boot_resource() {
            Ok(bios) => bios,
            Err(e) => {
                error!(computer = self.env.id(), "Failed to load BIOS: {}", e);
                self.display_failure("Error loading bios.lua", None);
                return None;
            }
        };

        let context = MachineContext {
            computer_id: self.env.id(),
            timeout: Arc::clone(self.handle.timeout()),
            host: self.env.global().host_string(),
            apis: read(&self.apis).iter().map(|api| api.name().to_string()).collect(),
        };

        let machine = match self.machines.create(context) {
            Ok(machine) => machine,
            Err(e) => {
                self.display_failure("Error loading bios.lua", Some(&e.0));
                return None;
            }
        };

        if let Err(e) = machine.load_boot(&bios) {
            machine.close();
            self.display_failure("Error loading bios.lua", Some(&e.0));
            return None;
        }

        Some(machine)
    }

    pub(super) fn display_failure(&self, message: &str, detail: Option<&str>) {
        let mut terminal = self.env.terminal();
        terminal.reset();

        if terminal.is_colour() {
            terminal.set_text_colour(Colour::Red);
        }
        terminal.write(message);

        if let Some(detail) = detail {
            let y = terminal.cursor_y() + 1;
            terminal.set_cursor_pos(0, y);
            terminal.write(detail);
        }

        let y = terminal.cursor_y() + 1;
        terminal.set_cursor_pos(0, y);
        if terminal.is_colour() {
            terminal.set_text_colour(Colour::White);
        }
        terminal.write("ComputerCraft may be installed incorrectly");
    }
}
