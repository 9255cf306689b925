// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IPMI-like power control of a single VM.
//!
//! The [`Controller`] is shared with the HTTP handlers; the launcher's run
//! loop owns the matching [`Commands`] receiver. Every command is delivered
//! as a rendezvous: the sending call returns only once the run loop has
//! taken the command off the channel.

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
}

/// Body of `GET /status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(rename = "PoweredOn")]
    pub powered_on: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmCommand {
    Start,
    Stop,
}

type Envelope = (VmCommand, oneshot::Sender<()>);

#[derive(Debug)]
struct Inner {
    power: PowerState,
    force_pxe: bool,
}

#[derive(Debug)]
pub struct Controller {
    inner: Mutex<Inner>,
    tx: mpsc::Sender<Envelope>,
}

/// Receiving end of the controller's command channel.
#[derive(Debug)]
pub struct Commands {
    rx: mpsc::Receiver<Envelope>,
}

impl Commands {
    /// Next command, acknowledging it to the sender. `None` once the
    /// controller is gone.
    pub async fn recv(&mut self) -> Option<VmCommand> {
        let (cmd, ack) = self.rx.recv().await?;
        let _ = ack.send(());
        Some(cmd)
    }
}

impl Controller {
    /// A controller for a VM that starts out powered on.
    pub fn new() -> (Self, Commands) {
        let (tx, rx) = mpsc::channel(1);
        let inner = Inner { power: PowerState::On, force_pxe: false };
        (Self { inner: Mutex::new(inner), tx }, Commands { rx })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // State is two plain fields; a poisoned guard still holds a
        // consistent value.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn send(&self, cmd: VmCommand) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send((cmd, ack_tx))
            .await
            .map_err(|_| anyhow!("VM run loop has exited"))?;
        ack_rx.await.map_err(|_| anyhow!("VM run loop dropped {cmd:?}"))
    }

    pub async fn power_on(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.power == PowerState::On {
                return Ok(());
            }
            inner.power = PowerState::On;
        }
        self.send(VmCommand::Start).await
    }

    pub async fn power_off(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.power == PowerState::Off {
                return Ok(());
            }
            inner.power = PowerState::Off;
        }
        self.send(VmCommand::Stop).await
    }

    /// Stop the running VM. Power stays on, so the run loop starts it
    /// again right away.
    pub async fn reboot(&self) -> Result<()> {
        if self.lock().power == PowerState::Off {
            return Ok(());
        }
        self.send(VmCommand::Stop).await
    }

    /// Boot from the network on the next start, once.
    pub fn pxe_boot_once(&self) {
        self.lock().force_pxe = true;
    }

    /// Return and clear the one-shot network boot flag.
    pub fn take_force_pxe_boot(&self) -> bool {
        std::mem::take(&mut self.lock().force_pxe)
    }

    pub fn power_state(&self) -> PowerState {
        self.lock().power
    }

    pub fn status(&self) -> Status {
        Status { powered_on: self.power_state() == PowerState::On }
    }
}
