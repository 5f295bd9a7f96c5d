use super::{
    Client, CompositorCommand, CompositorService, CompositorState, Monitor, TAG_COUNT, Workspace,
    WorkspaceId, river_protocol::*, sanitize_scale, tag_mask,
};
use anyhow::{Context, Result, anyhow, bail};
use log::{debug, error, warn};
use std::{cell::RefCell, thread};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use wayland_client::{
    Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum,
    protocol::{
        wl_output::{self, WlOutput},
        wl_registry::{self, WlRegistry},
        wl_seat::WlSeat,
    },
};

pub const NAME: &str = "river";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiverOutput {
    pub name: String,
    pub width: i32,
    pub height: i32,
    pub x: i32,
    pub y: i32,
    pub scale: i32,
    pub focused_tags: u32,
    pub occupied_tags: u32,
    pub urgent_tags: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiverSnapshot {
    pub outputs: Vec<RiverOutput>,
    pub focused_output: Option<String>,
    /// Title of the focused view, `None` when nothing is focused.
    pub focused_view: Option<String>,
}

pub struct RiverAdapter {
    service: CompositorService,
    connection: Connection,
    handle: QueueHandle<RiverState>,
    control: Option<ZriverControlV1>,
    seat: Option<WlSeat>,
    _registry: WlRegistry,
    producer: RefCell<Option<(EventQueue<RiverState>, RiverState)>>,
}

impl RiverAdapter {
    pub fn new() -> Result<Self> {
        let connection =
            Connection::connect_to_env().context("Failed to connect to the Wayland display")?;
        let mut event_queue = connection.new_event_queue();
        let handle = event_queue.handle();
        let registry = connection.display().get_registry(&handle, ());

        let mut state = RiverState::default();
        // globals first, then the output and status events they trigger
        event_queue.roundtrip(&mut state)?;
        event_queue.roundtrip(&mut state)?;

        if state.status_manager.is_none() {
            bail!(
                "{} is not advertised",
                ZriverStatusManagerV1::interface().name
            );
        }
        if state.control.is_none() {
            warn!("River control protocol is not advertised, commands are disabled");
        }

        state.dirty = false;
        let service = CompositorService::new(translate(&state.snapshot()));

        Ok(Self {
            service,
            control: state.control.clone(),
            seat: state.seat.as_ref().map(|(seat, _)| seat.clone()),
            connection,
            handle,
            _registry: registry,
            producer: RefCell::new(Some((event_queue, state))),
        })
    }

    pub fn is_available(&self) -> bool {
        self.connection.protocol_error().is_none()
    }

    pub fn service(&self) -> &CompositorService {
        &self.service
    }

    pub fn execute(&self, command: CompositorCommand) {
        let args = match command_args(&command) {
            Ok(args) => args,
            Err(e) => {
                error!("Cannot run {command:?} on River: {e}");
                return;
            }
        };

        let (Some(control), Some(seat)) = (&self.control, &self.seat) else {
            error!("Cannot run {command:?}: River control is not available");
            return;
        };

        for arg in &args {
            control.add_argument(arg.clone());
        }
        control.run_command(seat, &self.handle, args.join(" "));

        if let Err(e) = self.connection.flush() {
            error!("Failed to send River command: {e}");
        }
    }

    pub async fn listen(&self) -> Result<()> {
        let (event_queue, state) = self
            .producer
            .borrow_mut()
            .take()
            .ok_or_else(|| anyhow!("River events are already being listened to"))?;

        let (tx, mut rx) = unbounded_channel();
        let dispatcher = thread::Builder::new()
            .name("river-events".into())
            .spawn(move || dispatch_loop(event_queue, state, tx))?;

        while let Some(snapshot) = rx.recv().await {
            self.service.update(translate(&snapshot));
        }

        // the sender is gone, so the thread has returned
        dispatcher
            .join()
            .map_err(|_| anyhow!("River event thread panicked"))?
    }
}

fn dispatch_loop(
    mut event_queue: EventQueue<RiverState>,
    mut state: RiverState,
    tx: UnboundedSender<RiverSnapshot>,
) -> Result<()> {
    loop {
        event_queue.blocking_dispatch(&mut state)?;

        if state.dirty {
            state.dirty = false;
            if tx.send(state.snapshot()).is_err() {
                return Ok(());
            }
        }
    }
}

fn command_args(command: &CompositorCommand) -> Result<Vec<String>> {
    let mask = |id: &WorkspaceId| -> Result<u32> {
        id.as_number()
            .and_then(|n| u32::try_from(n).ok())
            .filter(|mask| *mask != 0)
            .ok_or_else(|| anyhow!("{id} is not a tag mask"))
    };

    Ok(match command {
        CompositorCommand::FocusWorkspace(id) => {
            vec!["set-focused-tags".to_owned(), mask(id)?.to_string()]
        }
        CompositorCommand::MoveClientToWorkspace { address, workspace } => {
            if !address.is_empty() {
                debug!("River moves the focused view, ignoring address {address}");
            }
            vec!["set-view-tags".to_owned(), mask(workspace)?.to_string()]
        }
    })
}

/// OR of every view's tags, sent by River as native-endian u32s.
fn occupied_mask(view_tags: &[u8]) -> u32 {
    view_tags
        .chunks_exact(4)
        .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .fold(0, |acc, tags| acc | tags)
}

/// One workspace per tag and output, in output order then tag order.
pub fn synthesize_workspaces(outputs: &[RiverOutput]) -> Vec<Workspace> {
    outputs
        .iter()
        .flat_map(|output| {
            (1..=TAG_COUNT).map(move |tag| {
                let mask = tag_mask(tag);
                Workspace {
                    id: WorkspaceId::Number(mask.into()),
                    name: tag.to_string(),
                    focused: output.focused_tags & mask != 0,
                    occupied: output.occupied_tags & mask != 0,
                    urgent: output.urgent_tags & mask != 0,
                    monitor: output.name.clone(),
                }
            })
        })
        .collect()
}

pub fn translate(snapshot: &RiverSnapshot) -> CompositorState {
    let outputs = snapshot
        .outputs
        .iter()
        .filter(|o| {
            if o.name.is_empty() {
                warn!("Skipping a River output that has not announced its name");
            }
            !o.name.is_empty()
        })
        .cloned()
        .collect::<Vec<_>>();

    let focused_output = snapshot.focused_output.as_ref().and_then(|name| {
        let output = outputs.iter().find(|o| &o.name == name);
        if output.is_none() {
            warn!("Focused output {name} is no longer available");
        }
        output
    });

    let monitors = outputs
        .iter()
        .map(|o| Monitor {
            name: o.name.clone(),
            width: o.width,
            height: o.height,
            x: o.x,
            y: o.y,
            scale: sanitize_scale(o.scale.into()),
            focused: focused_output.is_some_and(|f| f.name == o.name),
        })
        .collect::<Vec<_>>();

    let workspaces = synthesize_workspaces(&outputs);

    // lowest focused tag of the focused output
    let focused_workspace = focused_output.and_then(|output| {
        workspaces
            .iter()
            .find(|w| w.monitor == output.name && w.focused)
            .cloned()
    });

    let focused_client = snapshot.focused_view.as_ref().map(|title| Client {
        address: String::new(),
        title: title.clone(),
        class: String::new(),
        workspace: focused_workspace.as_ref().map(|w| w.id.clone()),
        monitor: focused_output.map(|o| o.name.clone()).unwrap_or_default(),
        floating: false,
        fullscreen: false,
        focused: true,
    });

    CompositorState {
        focused_monitor: monitors.iter().find(|m| m.focused).cloned(),
        monitors,
        workspaces,
        focused_workspace,
        clients: Vec::new(),
        focused_client,
    }
}

struct OutputEntry {
    global: u32,
    wl_output: WlOutput,
    status: Option<ZriverOutputStatusV1>,
    info: RiverOutput,
}

#[derive(Default)]
struct RiverState {
    status_manager: Option<(ZriverStatusManagerV1, u32)>,
    control: Option<ZriverControlV1>,
    seat: Option<(WlSeat, u32)>,
    seat_status: Option<ZriverSeatStatusV1>,
    outputs: Vec<OutputEntry>,
    focused_output: Option<u32>,
    focused_view: Option<String>,
    dirty: bool,
}

impl RiverState {
    fn snapshot(&self) -> RiverSnapshot {
        RiverSnapshot {
            outputs: self.outputs.iter().map(|o| o.info.clone()).collect(),
            focused_output: self.focused_output.and_then(|global| {
                self.outputs
                    .iter()
                    .find(|o| o.global == global)
                    .map(|o| o.info.name.clone())
            }),
            focused_view: self.focused_view.clone(),
        }
    }

    fn output_mut(&mut self, global: u32) -> Option<&mut OutputEntry> {
        self.outputs.iter_mut().find(|o| o.global == global)
    }

    /// Status objects need the manager plus the output or seat, which may be
    /// announced in any order.
    fn request_status(&mut self, handle: &QueueHandle<Self>) {
        let Some((manager, _)) = &self.status_manager else {
            return;
        };

        for output in self.outputs.iter_mut().filter(|o| o.status.is_none()) {
            output.status =
                Some(manager.get_river_output_status(&output.wl_output, handle, output.global));
        }

        if self.seat_status.is_none()
            && let Some((seat, _)) = &self.seat
        {
            self.seat_status = Some(manager.get_river_seat_status(seat, handle, ()));
        }
    }

    fn remove_output(&mut self, global: u32) -> bool {
        let Some(index) = self.outputs.iter().position(|o| o.global == global) else {
            return false;
        };

        let output = self.outputs.remove(index);
        debug!("River output {} removed", output.info.name);
        if let Some(status) = output.status {
            status.destroy();
        }
        if output.wl_output.version() >= 3 {
            output.wl_output.release();
        }
        if self.focused_output == Some(global) {
            self.focused_output = None;
        }

        true
    }
}

impl Dispatch<WlRegistry, ()> for RiverState {
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
                if interface == WlOutput::interface().name {
                    debug!("Adding output with name {name} and version {version}");
                    let wl_output: WlOutput = proxy.bind(name, version.min(4), handle, name);
                    state.outputs.push(OutputEntry {
                        global: name,
                        wl_output,
                        status: None,
                        info: RiverOutput::default(),
                    });
                } else if interface == WlSeat::interface().name && state.seat.is_none() {
                    debug!("Adding seat with name {name} and version {version}");
                    state.seat = Some((proxy.bind(name, version.min(1), handle, ()), name));
                } else if interface == ZriverStatusManagerV1::interface().name {
                    debug!("Adding river status manager with version {version}");
                    state.status_manager =
                        Some((proxy.bind(name, version.min(4), handle, ()), name));
                } else if interface == ZriverControlV1::interface().name {
                    debug!("Adding river control with version {version}");
                    state.control = Some(proxy.bind(name, 1, handle, ()));
                }

                state.request_status(handle);
            }
            wl_registry::Event::GlobalRemove { name } => {
                if state.remove_output(name) {
                    state.dirty = true;
                } else if state.seat.as_ref().is_some_and(|(_, seat)| *seat == name) {
                    warn!("River seat was removed");
                    state.seat = None;
                    state.seat_status = None;
                    state.focused_output = None;
                    state.focused_view = None;
                    state.dirty = true;
                } else if state
                    .status_manager
                    .as_ref()
                    .is_some_and(|(_, manager)| *manager == name)
                {
                    warn!("River status manager was removed");
                    state.status_manager = None;
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<WlOutput, u32> for RiverState {
    fn event(
        state: &mut Self,
        _proxy: &WlOutput,
        event: <WlOutput as Proxy>::Event,
        global: &u32,
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
        let Some(output) = state.output_mut(*global) else {
            return;
        };

        match event {
            wl_output::Event::Geometry { x, y, .. } => {
                output.info.x = x;
                output.info.y = y;
            }
            wl_output::Event::Mode {
                flags: WEnum::Value(flags),
                width,
                height,
                ..
            } if flags.contains(wl_output::Mode::Current) => {
                output.info.width = width;
                output.info.height = height;
            }
            wl_output::Event::Scale { factor } => output.info.scale = factor,
            wl_output::Event::Name { name } => output.info.name = name,
            wl_output::Event::Done => state.dirty = true,
            _ => {}
        }
    }
}

impl Dispatch<WlSeat, ()> for RiverState {
    fn event(
        _state: &mut Self,
        _proxy: &WlSeat,
        _event: <WlSeat as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<ZriverStatusManagerV1, ()> for RiverState {
    fn event(
        _state: &mut Self,
        _proxy: &ZriverStatusManagerV1,
        _event: <ZriverStatusManagerV1 as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
    } // This interface has no events.
}

impl Dispatch<ZriverControlV1, ()> for RiverState {
    fn event(
        _state: &mut Self,
        _proxy: &ZriverControlV1,
        _event: <ZriverControlV1 as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
    } // This interface has no events.
}

impl Dispatch<ZriverOutputStatusV1, u32> for RiverState {
    fn event(
        state: &mut Self,
        _proxy: &ZriverOutputStatusV1,
        event: <ZriverOutputStatusV1 as Proxy>::Event,
        global: &u32,
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
        let Some(output) = state.output_mut(*global) else {
            return;
        };

        match event {
            zriver_output_status_v1::Event::FocusedTags { tags } => output.info.focused_tags = tags,
            zriver_output_status_v1::Event::ViewTags { tags } => {
                output.info.occupied_tags = occupied_mask(&tags);
            }
            zriver_output_status_v1::Event::UrgentTags { tags } => output.info.urgent_tags = tags,
            _ => return,
        }

        state.dirty = true;
    }
}

impl Dispatch<ZriverSeatStatusV1, ()> for RiverState {
    fn event(
        state: &mut Self,
        _proxy: &ZriverSeatStatusV1,
        event: <ZriverSeatStatusV1 as Proxy>::Event,
        _data: &(),
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
        match event {
            zriver_seat_status_v1::Event::FocusedOutput { output } => {
                state.focused_output = output.data::<u32>().copied();
            }
            zriver_seat_status_v1::Event::UnfocusedOutput { output } => {
                if state.focused_output == output.data::<u32>().copied() {
                    state.focused_output = None;
                }
            }
            zriver_seat_status_v1::Event::FocusedView { title } => {
                state.focused_view = (!title.is_empty()).then_some(title);
            }
            _ => return,
        }

        state.dirty = true;
    }
}

impl Dispatch<ZriverCommandCallbackV1, String> for RiverState {
    fn event(
        _state: &mut Self,
        _proxy: &ZriverCommandCallbackV1,
        event: <ZriverCommandCallbackV1 as Proxy>::Event,
        command: &String,
        _conn: &Connection,
        _handle: &QueueHandle<Self>,
    ) {
        match event {
            zriver_command_callback_v1::Event::Success { output } => {
                debug!("River ran `{command}`: {output}");
            }
            zriver_command_callback_v1::Event::Failure { failure_message } => {
                error!("River rejected `{command}`: {failure_message}");
            }
        }
    }
}
