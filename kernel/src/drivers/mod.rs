//! Device drivers: the UART, the console line discipline on top of it,
//! and the virtio block device.

pub mod console;
pub mod uart;
pub mod virtio;
