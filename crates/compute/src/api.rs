/// A module installed into a computer (terminal, redstone, filesystem, ...).
///
/// Hooks run on the computer's worker for `startup`/`shutdown`, and on the
/// host thread for `update`. `update` is skipped entirely while the computer
/// is turning on or off.
pub trait ComputerApi: Send + Sync {
    fn name(&self) -> &str;

    fn startup(&self) {}

    fn update(&self) {}

    fn shutdown(&self) {}
}
