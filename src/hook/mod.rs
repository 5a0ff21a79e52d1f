//! The OS boundary (§5, §10.4): grabs real input devices, normalizes their
//! events into `engine::InputEvent`, drives the `StateEngine`, and flushes
//! its synthetic output back out through one uinput virtual device.
//!
//! Linux has no single "low-level hook" primitive the way Windows does, so
//! this realizes it as an exclusive `evdev` grab per keyboard-class device,
//! a non-exclusive open per pointer device (just to observe button activity),
//! and a single-threaded `nix::poll` loop across every device's fd.

use std::os::fd::BorrowedFd;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, Device, EventType, InputEvent as EvdevEvent, Key};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};

use crate::catalog::KeyDescriptor;
use crate::engine::{Direction, InputEvent, StateEngine, SyntheticEvent};

fn syn_report() -> EvdevEvent {
    EvdevEvent::new(EventType::SYNCHRONIZATION, 0, 0)
}

/// A grabbed device plus enough to re-open it if the kernel drops it.
struct GrabbedDevice {
    path: PathBuf,
    device: Device,
    exclusive: bool,
}

impl GrabbedDevice {
    fn open(path: PathBuf, exclusive: bool) -> Result<Self> {
        let mut device = Device::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        if exclusive {
            device
                .grab()
                .with_context(|| format!("failed to grab {}", path.display()))?;
        }
        Ok(Self {
            path,
            device,
            exclusive,
        })
    }

    fn regrab(&mut self) -> Result<()> {
        let _ = self.device.ungrab();
        self.device = Device::open(&self.path)
            .with_context(|| format!("failed to reopen {}", self.path.display()))?;
        if self.exclusive {
            self.device.grab()?;
        }
        Ok(())
    }
}

fn is_keyboard(device: &Device) -> bool {
    device
        .supported_keys()
        .map(|keys| {
            keys.contains(evdev::Key::KEY_A)
                && keys.contains(evdev::Key::KEY_Z)
                && keys.contains(evdev::Key::KEY_SPACE)
        })
        .unwrap_or(false)
}

fn is_pointer(device: &Device) -> bool {
    device
        .supported_keys()
        .map(|keys| keys.contains(evdev::Key::BTN_LEFT))
        .unwrap_or(false)
}

fn build_virtual_device(keyboards: &[GrabbedDevice]) -> Result<VirtualDevice> {
    let mut keys = AttributeSet::<Key>::new();
    for gd in keyboards {
        if let Some(supported) = gd.device.supported_keys() {
            for k in supported {
                keys.insert(k);
            }
        }
    }
    VirtualDeviceBuilder::new()?
        .name("keyremapd virtual keyboard")
        .with_keys(&keys)?
        .build()
        .context("failed to create uinput virtual device")
}

/// Registers the input hooks, flushes synthetic output, and re-grabs on a
/// rehook timeout. Owns every grabbed device and the single uinput sink.
pub struct HookAdapter {
    keyboards: Vec<GrabbedDevice>,
    pointers: Vec<GrabbedDevice>,
    vdev: VirtualDevice,
    rehook_timeout: u32,
    start: Instant,
    last_genuine_ms: u32,
    shutdown: Arc<AtomicBool>,
}

impl HookAdapter {
    pub fn new(rehook_timeout: u32) -> Result<Self> {
        let mut keyboards = Vec::new();
        let mut pointers = Vec::new();

        for (path, device) in evdev::enumerate() {
            if device
                .name()
                .map(|n| n.contains("keyremapd"))
                .unwrap_or(false)
            {
                continue;
            }
            if is_keyboard(&device) {
                drop(device);
                keyboards.push(GrabbedDevice::open(path, true)?);
            } else if is_pointer(&device) {
                drop(device);
                pointers.push(GrabbedDevice::open(path, false)?);
            }
        }

        if keyboards.is_empty() {
            warn!("no keyboard-class input devices found to grab");
        }

        let vdev = build_virtual_device(&keyboards)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
            .context("failed to register SIGINT handler")?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
            .context("failed to register SIGTERM handler")?;

        Ok(Self {
            keyboards,
            pointers,
            vdev,
            rehook_timeout,
            start: Instant::now(),
            last_genuine_ms: 0,
            shutdown,
        })
    }

    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    /// Drive `engine` until a shutdown signal arrives, then run `unlock_all`
    /// and ungrab every device before returning.
    pub fn run(&mut self, engine: &mut StateEngine) -> Result<()> {
        info!(
            "grabbed {} keyboard(s), observing {} pointer(s)",
            self.keyboards.len(),
            self.pointers.len()
        );

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("shutdown signal received, releasing devices");
                let mut outputs = Vec::new();
                engine.unlock_all(&mut outputs);
                self.flush(&outputs)?;
                for gd in &mut self.keyboards {
                    let _ = gd.device.ungrab();
                }
                return Ok(());
            }

            let mut fds: Vec<PollFd> = self
                .keyboards
                .iter()
                .chain(self.pointers.iter())
                .map(|gd| {
                    // SAFETY: the borrow doesn't outlive this poll() call, and
                    // the owning `Device` stays alive in `self` throughout.
                    let raw = gd.device.as_raw_fd();
                    PollFd::new(unsafe { BorrowedFd::borrow_raw(raw) }, PollFlags::POLLIN)
                })
                .collect();

            let n = poll(&mut fds, PollTimeout::from(200u8))?;
            if n > 0 {
                self.drain_ready(&fds, engine)?;
            }

            if self.rehook_timeout > 0
                && self.now_ms().wrapping_sub(self.last_genuine_ms) > self.rehook_timeout
                && self.last_genuine_ms > 0
            {
                self.regrab_all();
                self.last_genuine_ms = self.now_ms();
            }
        }
    }

    fn fd_ready(fds: &[PollFd], idx: usize) -> bool {
        fds.get(idx)
            .and_then(|p| p.revents())
            .map(|r| r.contains(PollFlags::POLLIN))
            .unwrap_or(false)
    }

    /// `fds` is indexed in the same order `run` built it: every keyboard,
    /// then every pointer.
    fn drain_ready(&mut self, fds: &[PollFd], engine: &mut StateEngine) -> Result<()> {
        let kb_count = self.keyboards.len();
        for i in 0..kb_count {
            if !Self::fd_ready(fds, i) {
                continue;
            }
            let events: Vec<_> = match self.keyboards[i].device.fetch_events() {
                Ok(evs) => evs.collect(),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            };
            for ev in events {
                self.handle_keyboard_event(ev, engine)?;
            }
        }

        for j in 0..self.pointers.len() {
            if !Self::fd_ready(fds, kb_count + j) {
                continue;
            }
            let events: Vec<_> = match self.pointers[j].device.fetch_events() {
                Ok(evs) => evs.collect(),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            };
            for ev in events {
                self.handle_pointer_event(ev, engine)?;
            }
        }
        Ok(())
    }

    fn handle_keyboard_event(&mut self, ev: EvdevEvent, engine: &mut StateEngine) -> Result<()> {
        if ev.event_type() != EventType::KEY {
            return Ok(());
        }
        let direction = match ev.value() {
            1 => Direction::Down,
            0 => Direction::Up,
            _ => return Ok(()), // autorepeat (value 2): not a transition
        };

        let t = self.now_ms();
        self.last_genuine_ms = t;

        let input = InputEvent {
            scan_code: ev.code(),
            virtual_code: ev.code(),
            direction,
            time_ms: t,
            // Never reading back our own uinput device, so every event
            // observed here is genuine by construction on this platform.
            is_injected: false,
            extra_info: 0,
        };

        let result = engine.handle(input);
        if result.block {
            self.flush(&result.outputs)?;
        } else {
            self.vdev.emit(&[ev, syn_report()])?;
        }
        Ok(())
    }

    fn handle_pointer_event(&mut self, ev: EvdevEvent, engine: &mut StateEngine) -> Result<()> {
        if ev.event_type() != EventType::KEY || ev.value() != 1 {
            return Ok(());
        }
        let t = self.now_ms();
        self.last_genuine_ms = t;
        let input = InputEvent {
            scan_code: 0,
            virtual_code: KeyDescriptor::MOUSE_PLACEHOLDER.virtual_code,
            direction: Direction::Down,
            time_ms: t,
            is_injected: false,
            extra_info: 0,
        };
        let result = engine.handle(input);
        self.flush(&result.outputs)
    }

    fn flush(&mut self, outputs: &[SyntheticEvent]) -> Result<()> {
        if outputs.is_empty() {
            return Ok(());
        }
        let mut batch: Vec<EvdevEvent> = Vec::with_capacity(outputs.len() * 2);
        for out in outputs {
            let code = if out.descriptor.virtual_code != 0 {
                out.descriptor.virtual_code
            } else {
                out.descriptor.scan_code
            };
            let value = match out.direction {
                Direction::Down => 1,
                Direction::Up => 0,
            };
            batch.push(EvdevEvent::new(EventType::KEY, code, value));
            batch.push(syn_report());
        }
        self.vdev.emit(&batch)?;
        debug!(count = outputs.len(), "flushed synthetic events");
        Ok(())
    }

    fn regrab_all(&mut self) {
        for gd in &mut self.keyboards {
            if let Err(e) = gd.regrab() {
                warn!("rehook failed for {}: {}", gd.path.display(), e);
            }
        }
        debug!("rehooked {} keyboard device(s)", self.keyboards.len());
    }
}
