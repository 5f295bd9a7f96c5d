//! The shell's own Wayland client: output enumeration plus layer-shell strips
//! drawn into shared-memory buffers.
//!
//! Everything here runs on the main thread. The connection is driven by
//! [`Toolkit::run`], which only borrows the state while dispatching, so
//! surfaces can be created and painted from reactive callbacks.

use crate::{
    config::{BarConfig, Position},
    outputs::{MonitorRegistry, UiSurface},
    reactive::Signal,
    services::compositor::ToolkitMonitor,
};
use anyhow::{Context, Result, bail};
use hex_color::HexColor;
use log::{debug, error, info, warn};
use std::{
    cell::RefCell,
    collections::HashMap,
    io::{self, Write},
    os::fd::AsFd,
    rc::{Rc, Weak},
};
use tokio::io::{Interest, unix::AsyncFd};
use wayland_client::{
    Connection, Dispatch, EventQueue, Proxy, QueueHandle,
    backend::{ObjectId, WaylandError},
    protocol::{
        wl_buffer::{self, WlBuffer},
        wl_compositor::WlCompositor,
        wl_output::{self, WlOutput},
        wl_registry::{self, WlRegistry},
        wl_shm::{self, WlShm},
        wl_shm_pool::WlShmPool,
        wl_surface::WlSurface,
    },
};
use wayland_protocols_wlr::layer_shell::v1::client::{
    zwlr_layer_shell_v1::{self, ZwlrLayerShellV1},
    zwlr_layer_surface_v1::{self, Anchor, ZwlrLayerSurfaceV1},
};

const NAMESPACE: &str = "matshell";
const CELL_GAP: u32 = 2;

/// A toolkit monitor handle: the bound `wl_output` and its connector name.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputHandle {
    wl_output: WlOutput,
    name: Option<String>,
}

impl ToolkitMonitor for OutputHandle {
    fn connector(&self) -> Option<String> {
        self.name.clone()
    }
}

struct ToolkitInner {
    connection: Connection,
    queue: RefCell<EventQueue<ToolkitState>>,
    handle: QueueHandle<ToolkitState>,
    state: RefCell<ToolkitState>,
    outputs_changed: Signal<()>,
    _registry: WlRegistry,
}

#[derive(Clone)]
pub struct Toolkit(Rc<ToolkitInner>);

impl Toolkit {
    pub fn connect() -> Result<Self> {
        let connection =
            Connection::connect_to_env().context("Failed to connect to the Wayland display")?;
        let mut queue = connection.new_event_queue();
        let handle = queue.handle();
        let registry = connection.display().get_registry(&handle, ());

        let mut state = ToolkitState::default();
        queue.roundtrip(&mut state)?;
        queue.roundtrip(&mut state)?;

        if state.layer_shell.is_none() {
            bail!("{} is not advertised", ZwlrLayerShellV1::interface().name);
        }
        state.outputs_changed = false;

        info!(
            "Toolkit connected with {} output(s)",
            state.outputs.iter().filter(|o| o.ready).count()
        );

        Ok(Self(Rc::new(ToolkitInner {
            connection,
            queue: RefCell::new(queue),
            handle,
            state: RefCell::new(state),
            outputs_changed: Signal::new(),
            _registry: registry,
        })))
    }

    /// Emitted after the set of outputs, or their names, changed.
    pub fn outputs_changed(&self) -> Signal<()> {
        self.0.outputs_changed.clone()
    }

    pub async fn run(&self) -> Result<()> {
        let fd = AsyncFd::with_interest(
            self.0.connection.backend().poll_fd().try_clone_to_owned()?,
            Interest::READABLE,
        )?;

        loop {
            self.dispatch_pending()?;
            self.0.connection.flush()?;

            let Some(guard) = self.0.queue.borrow().prepare_read() else {
                continue;
            };

            let mut ready = fd.readable().await?;
            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    ready.clear_ready();
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn dispatch_pending(&self) -> Result<()> {
        let changed = {
            let mut state = self.0.state.borrow_mut();
            self.0.queue.borrow_mut().dispatch_pending(&mut *state)?;
            std::mem::take(&mut state.outputs_changed)
        };

        if changed {
            debug!("Toolkit outputs changed");
            self.0.outputs_changed.emit(&());
        }

        Ok(())
    }

    pub fn flush(&self) {
        if let Err(e) = self.0.connection.flush() {
            warn!("Failed to flush the Wayland connection: {e}");
        }
    }

    /// Creates a strip anchored to one edge of `output`. It is drawn once the
    /// compositor configures it.
    pub fn create_surface(
        &self,
        output: &OutputHandle,
        bar: &BarConfig,
        background: HexColor,
        cells: Vec<HexColor>,
    ) -> Result<LayerSurface> {
        let mut state = self.0.state.borrow_mut();
        let (Some(compositor), Some(layer_shell)) = (&state.compositor, &state.layer_shell) else {
            bail!("wl_compositor or layer shell is not available");
        };

        let wl_surface = compositor.create_surface(&self.0.handle, ());
        let layer = layer_shell.get_layer_surface(
            &wl_surface,
            Some(&output.wl_output),
            zwlr_layer_shell_v1::Layer::Top,
            NAMESPACE.to_owned(),
            &self.0.handle,
            (),
        );
        layer.set_anchor(
            match bar.position {
                Position::Top => Anchor::Top,
                Position::Bottom => Anchor::Bottom,
            } | Anchor::Left
                | Anchor::Right,
        );
        layer.set_size(0, bar.height);
        layer.set_exclusive_zone(i32::try_from(bar.height)?);
        wl_surface.commit();

        let id = layer.id();
        state.surfaces.insert(
            id.clone(),
            SurfaceSlot {
                wl_surface,
                layer,
                size: (0, 0),
                configured: false,
                hidden: false,
                background,
                cells,
            },
        );
        drop(state);
        self.flush();

        Ok(LayerSurface {
            painter: Painter {
                toolkit: Rc::downgrade(&self.0),
                id,
            },
        })
    }
}

impl MonitorRegistry for Toolkit {
    type Handle = OutputHandle;

    fn monitors(&self) -> Vec<OutputHandle> {
        self.0
            .state
            .borrow()
            .outputs
            .iter()
            .filter(|o| o.ready)
            .map(|o| OutputHandle {
                wl_output: o.wl_output.clone(),
                name: o.name.clone(),
            })
            .collect()
    }
}

/// Repaints a surface; does nothing once the surface or toolkit is gone.
#[derive(Clone)]
pub struct Painter {
    toolkit: Weak<ToolkitInner>,
    id: ObjectId,
}

impl Painter {
    pub fn paint(&self, cells: Vec<HexColor>) {
        let Some(toolkit) = self.toolkit.upgrade() else {
            return;
        };

        let mut state = toolkit.state.borrow_mut();
        let shm = state.shm.clone();
        let Some(slot) = state.surfaces.get_mut(&self.id) else {
            debug!("Surface {} is gone, not painting", self.id);
            return;
        };

        slot.cells = cells;
        if slot.configured
            && !slot.hidden
            && let Some(shm) = &shm
            && let Err(e) = draw(slot, shm, &toolkit.handle)
        {
            error!("Failed to draw surface: {e:#}");
        }
        drop(state);

        Toolkit(toolkit).flush();
    }

    fn with_slot(&self, f: impl FnOnce(&mut ToolkitState, &ObjectId)) {
        if let Some(toolkit) = self.toolkit.upgrade() {
            f(&mut toolkit.state.borrow_mut(), &self.id);
            Toolkit(toolkit).flush();
        }
    }
}

pub struct LayerSurface {
    painter: Painter,
}

impl LayerSurface {
    pub fn painter(&self) -> Painter {
        self.painter.clone()
    }
}

impl UiSurface for LayerSurface {
    fn hide(&mut self) {
        self.painter.with_slot(|state, id| {
            if let Some(slot) = state.surfaces.get_mut(id) {
                slot.hidden = true;
                slot.wl_surface.attach(None, 0, 0);
                slot.wl_surface.commit();
            }
        });
    }

    fn destroy(self) {
        self.painter.with_slot(|state, id| {
            if let Some(slot) = state.surfaces.remove(id) {
                slot.layer.destroy();
                slot.wl_surface.destroy();
            }
        });
    }
}

/// One row of ARGB8888 pixels, repeated `height` times.
///
/// The width is split evenly between `cells`, separated by a gap of
/// background.
pub fn render(width: u32, height: u32, background: HexColor, cells: &[HexColor]) -> Vec<u8> {
    let count = cells.len() as u32;
    let gap = if count > 0 && width / count > 2 * CELL_GAP {
        CELL_GAP
    } else {
        0
    };

    let row = (0..width)
        .flat_map(|x| {
            let color = if count == 0 {
                background
            } else {
                let index = (x * count / width).min(count - 1);
                let start = index * width / count;
                if index > 0 && x < start + gap {
                    background
                } else {
                    cells[index as usize]
                }
            };
            [color.b, color.g, color.r, color.a]
        })
        .collect::<Vec<_>>();

    row.repeat(height as usize)
}

fn draw(slot: &mut SurfaceSlot, shm: &WlShm, handle: &QueueHandle<ToolkitState>) -> Result<()> {
    let (width, height) = slot.size;
    if width == 0 || height == 0 {
        return Ok(());
    }

    let pixels = render(width, height, slot.background, &slot.cells);
    let mut file = tempfile::tempfile()?;
    file.write_all(&pixels)?;

    let pool = shm.create_pool(file.as_fd(), i32::try_from(pixels.len())?, handle, ());
    let buffer = pool.create_buffer(
        0,
        i32::try_from(width)?,
        i32::try_from(height)?,
        i32::try_from(width * 4)?,
        wl_shm::Format::Argb8888,
        handle,
        (),
    );
    pool.destroy();

    slot.wl_surface.attach(Some(&buffer), 0, 0);
    slot.wl_surface
        .damage(0, 0, i32::try_from(width)?, i32::try_from(height)?);
    slot.wl_surface.commit();

    Ok(())
}

struct ToolkitOutput {
    global: u32,
    wl_output: WlOutput,
    name: Option<String>,
    ready: bool,
}

struct SurfaceSlot {
    wl_surface: WlSurface,
    layer: ZwlrLayerSurfaceV1,
    size: (u32, u32),
    configured: bool,
    hidden: bool,
    background: HexColor,
    cells: Vec<HexColor>,
}

#[derive(Default)]
struct ToolkitState {
    compositor: Option<WlCompositor>,
    shm: Option<WlShm>,
    layer_shell: Option<ZwlrLayerShellV1>,
    outputs: Vec<ToolkitOutput>,
    surfaces: HashMap<ObjectId, SurfaceSlot>,
    outputs_changed: bool,
}

impl Dispatch<WlRegistry, ()> for ToolkitState {
    fn event(
        state: &mut Self,
        proxy: &WlRegistry,
        event: <WlRegistry as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        handle: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => {
                if interface == WlCompositor::interface().name && state.compositor.is_none() {
                    state.compositor = Some(proxy.bind(name, version.min(4), handle, ()));
                } else if interface == WlShm::interface().name && state.shm.is_none() {
                    state.shm = Some(proxy.bind(name, 1, handle, ()));
                } else if interface == ZwlrLayerShellV1::interface().name
                    && state.layer_shell.is_none()
                {
                    state.layer_shell = Some(proxy.bind(name, version.min(4), handle, ()));
                } else if interface == WlOutput::interface().name {
                    debug!("Toolkit output global {name} (version {version})");
                    if version < 4 {
                        warn!("wl_output version {version} does not announce connector names");
                    }
                    state.outputs.push(ToolkitOutput {
                        global: name,
                        wl_output: proxy.bind(name, version.min(4), handle, name),
                        name: None,
                        ready: false,
                    });
                }
            }
            wl_registry::Event::GlobalRemove { name } => {
                if let Some(index) = state.outputs.iter().position(|o| o.global == name) {
                    let output = state.outputs.remove(index);
                    debug!("Toolkit output {:?} removed", output.name);
                    if output.wl_output.version() >= 3 {
                        output.wl_output.release();
                    }
                    state.outputs_changed = true;
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<WlOutput, u32> for ToolkitState {
    fn event(
        state: &mut Self,
        _proxy: &WlOutput,
        event: <WlOutput as Proxy>::Event,
        global: &u32,
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
        let Some(output) = state.outputs.iter_mut().find(|o| o.global == *global) else {
            return;
        };

        match event {
            wl_output::Event::Name { name } => output.name = Some(name),
            wl_output::Event::Done => {
                output.ready = true;
                state.outputs_changed = true;
            }
            _ => {}
        }
    }
}

impl Dispatch<WlBuffer, ()> for ToolkitState {
    fn event(
        _state: &mut Self,
        proxy: &WlBuffer,
        event: <WlBuffer as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            proxy.destroy();
        }
    }
}

impl Dispatch<ZwlrLayerSurfaceV1, ()> for ToolkitState {
    fn event(
        state: &mut Self,
        proxy: &ZwlrLayerSurfaceV1,
        event: <ZwlrLayerSurfaceV1 as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        handle: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_layer_surface_v1::Event::Configure {
                serial,
                width,
                height,
            } => {
                proxy.ack_configure(serial);

                let shm = state.shm.clone();
                let Some(slot) = state.surfaces.get_mut(&proxy.id()) else {
                    return;
                };
                slot.size = (width, height);
                slot.configured = true;

                if !slot.hidden
                    && let Some(shm) = &shm
                    && let Err(e) = draw(slot, shm, handle)
                {
                    error!("Failed to draw surface: {e:#}");
                }
            }
            zwlr_layer_surface_v1::Event::Closed => {
                debug!("Layer surface {} closed by the compositor", proxy.id());
            }
            _ => {}
        }
    }
}

macro_rules! ignore_events {
    ($($interface:ty),+) => {
        $(
            impl Dispatch<$interface, ()> for ToolkitState {
                fn event(
                    _state: &mut Self,
                    _proxy: &$interface,
                    _event: <$interface as Proxy>::Event,
                    _data: &(),
                    _conn: &Connection,
                    _handle: &QueueHandle<Self>,
                ) {
                }
            }
        )+
    };
}

ignore_events!(WlCompositor, WlShm, WlShmPool, WlSurface, ZwlrLayerShellV1);
