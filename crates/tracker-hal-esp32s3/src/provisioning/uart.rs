//! Credential provisioning over a UART console.
//!
//! `SET WIFI` lines are accepted at any time; `start` only announces that
//! the device is waiting for them.

use esp_hal::{Blocking, uart::Uart};
use log::{info, warn};
use tracker_core::{
    network::{Provisioning, WifiCredentials},
    provisioning::CommandLineBuffer,
};

const RX_CHUNK_BYTES: usize = 32;

pub struct UartProvisioning<'d> {
    uart: Uart<'d, Blocking>,
    line: CommandLineBuffer,
    waiting: bool,
    done: bool,
}

impl<'d> UartProvisioning<'d> {
    pub fn new(uart: Uart<'d, Blocking>) -> Self {
        Self {
            uart,
            line: CommandLineBuffer::new(),
            waiting: false,
            done: false,
        }
    }
}

impl Provisioning for UartProvisioning<'_> {
    fn start(&mut self) {
        if self.waiting {
            return;
        }
        self.waiting = true;
        info!("provisioning: waiting for SET WIFI \"<ssid>\" \"<password>\" on the console");
    }

    fn stop(&mut self) {
        self.waiting = false;
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn poll(&mut self, _now_ms: u64) -> Option<WifiCredentials> {
        let mut chunk = [0u8; RX_CHUNK_BYTES];
        let mut received = None;
        loop {
            let read = match self.uart.read_buffered(&mut chunk) {
                Ok(read) => read,
                Err(err) => {
                    warn!("provisioning: uart rx error: {:?}", err);
                    break;
                }
            };
            if read == 0 {
                break;
            }
            for byte in &chunk[..read] {
                if let Some(credentials) = self.line.push_byte(*byte) {
                    received = Some(credentials);
                }
            }
        }

        if received.is_some() && self.waiting {
            self.done = true;
            self.waiting = false;
        }
        received
    }
}
