use super::{
    Client, CompositorCommand, CompositorService, CompositorState, Monitor, Workspace,
    WorkspaceId, sanitize_scale,
};
use anyhow::{Context, Result, anyhow, bail};
use hyprland::{
    data::{
        Client as HyprClientData, Clients, FullscreenMode, Monitors, Workspace as HyprWorkspaceData,
        Workspaces,
    },
    dispatch::{Dispatch, DispatchType, WorkspaceIdentifierWithSpecial},
    event_listener::AsyncEventListener,
    prelude::*,
};
use itertools::Itertools;
use log::{debug, error, warn};
use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
};
use tokio::{
    sync::mpsc::{UnboundedSender, unbounded_channel},
    task::AbortHandle,
};

pub const NAME: &str = "hyprland";

const IPC_ENV_VAR: &str = "HYPRLAND_INSTANCE_SIGNATURE";

#[derive(Debug, Clone, PartialEq)]
pub struct HyprMonitor {
    pub name: String,
    pub width: u16,
    pub height: u16,
    pub x: i32,
    pub y: i32,
    pub scale: f32,
    pub focused: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HyprWorkspace {
    pub id: i32,
    pub name: String,
    pub monitor: String,
    pub windows: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HyprClient {
    pub address: String,
    pub title: String,
    pub class: String,
    pub workspace_id: i32,
    pub floating: bool,
    pub fullscreen: bool,
}

/// Raw query results, taken one after the other. Objects may reference each
/// other across queries and already be gone in a later one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HyprSnapshot {
    pub monitors: Vec<HyprMonitor>,
    pub workspaces: Vec<HyprWorkspace>,
    pub clients: Vec<HyprClient>,
    pub active_workspace_id: Option<i32>,
    pub active_client: Option<String>,
    pub urgent: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
struct HyprInternalState {
    urgent: HashSet<String>,
}

pub struct HyprlandAdapter {
    service: CompositorService,
    internal_state: Arc<RwLock<HyprInternalState>>,
}

impl HyprlandAdapter {
    pub fn new() -> Result<Self> {
        if std::env::var_os(IPC_ENV_VAR).is_none() {
            bail!("{IPC_ENV_VAR} is not set");
        }

        let mut internal_state = HyprInternalState::default();
        let snapshot =
            fetch_snapshot(&mut internal_state).context("Failed to query Hyprland state")?;

        Ok(Self {
            service: CompositorService::new(translate(&snapshot)),
            internal_state: Arc::new(RwLock::new(internal_state)),
        })
    }

    pub fn is_available(&self) -> bool {
        Monitors::get().is_ok()
    }

    pub fn service(&self) -> &CompositorService {
        &self.service
    }

    pub fn execute(&self, command: CompositorCommand) {
        tokio::task::spawn_blocking(move || {
            if let Err(e) = dispatch(&command) {
                error!("Hyprland rejected {command:?}: {e}");
            }
        });
    }

    pub async fn listen(&self) -> Result<()> {
        let (tx, mut rx) = unbounded_channel();
        let listener = tokio::task::spawn_local(run_listener(tx, self.internal_state.clone()));
        let _abort = AbortOnDrop(listener.abort_handle());

        while let Some(snapshot) = rx.recv().await {
            self.service.update(translate(&snapshot));
        }

        listener.await?
    }
}

/// Stops the event listener once `listen` is dropped or returns.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn dispatch(command: &CompositorCommand) -> Result<()> {
    match command {
        CompositorCommand::FocusWorkspace(WorkspaceId::Number(id)) => {
            let id = i32::try_from(*id).map_err(|_| anyhow!("Workspace id {id} is out of range"))?;
            Dispatch::call(DispatchType::Workspace(WorkspaceIdentifierWithSpecial::Id(
                id,
            )))?;
        }
        CompositorCommand::FocusWorkspace(WorkspaceId::Name(name)) => {
            Dispatch::call(DispatchType::Custom("workspace", name))?;
        }
        CompositorCommand::MoveClientToWorkspace { address, workspace } => {
            Dispatch::call(DispatchType::Custom(
                "movetoworkspacesilent",
                &move_args(address, workspace),
            ))?;
        }
    }

    Ok(())
}

fn move_args(address: &str, workspace: &WorkspaceId) -> String {
    format!("{workspace},address:{address}")
}

async fn run_listener(
    tx: UnboundedSender<HyprSnapshot>,
    internal_state: Arc<RwLock<HyprInternalState>>,
) -> Result<()> {
    let mut listener = AsyncEventListener::new();

    macro_rules! add_refresh_handler {
        ($method:ident) => {
            listener.$method({
                let tx = tx.clone();
                let internal_state = Arc::clone(&internal_state);
                move |_| {
                    let tx = tx.clone();
                    let internal_state = Arc::clone(&internal_state);
                    Box::pin(async move {
                        refresh(&tx, &internal_state);
                    })
                }
            });
        };
    }

    add_refresh_handler!(add_monitor_added_handler);
    add_refresh_handler!(add_monitor_removed_handler);
    add_refresh_handler!(add_active_monitor_changed_handler);

    add_refresh_handler!(add_workspace_added_handler);
    add_refresh_handler!(add_workspace_changed_handler);
    add_refresh_handler!(add_workspace_deleted_handler);
    add_refresh_handler!(add_workspace_moved_handler);
    add_refresh_handler!(add_changed_special_handler);
    add_refresh_handler!(add_special_removed_handler);

    add_refresh_handler!(add_window_closed_handler);
    add_refresh_handler!(add_window_opened_handler);
    add_refresh_handler!(add_window_moved_handler);
    add_refresh_handler!(add_active_window_changed_handler);
    add_refresh_handler!(add_window_title_changed_handler);
    add_refresh_handler!(add_float_state_changed_handler);
    add_refresh_handler!(add_fullscreen_state_changed_handler);

    // urgency is only ever reported as an event, remember it
    listener.add_urgent_state_changed_handler({
        let tx = tx.clone();
        let internal_state = Arc::clone(&internal_state);
        move |address| {
            let tx = tx.clone();
            let internal_state = Arc::clone(&internal_state);
            Box::pin(async move {
                if let Ok(mut state_guard) = internal_state.write() {
                    state_guard.urgent.insert(address.to_string());
                }
                refresh(&tx, &internal_state);
            })
        }
    });

    listener
        .start_listener_async()
        .await
        .map_err(|e| anyhow!(e))
}

fn refresh(tx: &UnboundedSender<HyprSnapshot>, internal_state: &RwLock<HyprInternalState>) {
    let Ok(mut state_guard) = internal_state.write() else {
        return;
    };

    match fetch_snapshot(&mut state_guard) {
        Ok(snapshot) => {
            let _ = tx.send(snapshot);
        }
        Err(e) => warn!("Failed to refresh Hyprland state, keeping the last one: {e}"),
    }
}

fn fetch_snapshot(internal_state: &mut HyprInternalState) -> Result<HyprSnapshot> {
    let monitors = Monitors::get()?
        .into_iter()
        .map(|m| HyprMonitor {
            name: m.name,
            width: m.width,
            height: m.height,
            x: m.x,
            y: m.y,
            scale: m.scale,
            focused: m.focused,
        })
        .collect();

    let workspaces = Workspaces::get()?
        .into_iter()
        .sorted_by_key(|w| w.id)
        .map(|w| HyprWorkspace {
            id: w.id,
            name: w.name,
            monitor: w.monitor,
            windows: w.windows,
        })
        .collect();

    let clients = Clients::get()?
        .into_iter()
        .map(|c| HyprClient {
            address: c.address.to_string(),
            title: c.title,
            class: c.class,
            workspace_id: c.workspace.id,
            floating: c.floating,
            fullscreen: !matches!(c.fullscreen, FullscreenMode::None),
        })
        .collect::<Vec<_>>();

    let active_workspace_id = HyprWorkspaceData::get_active().ok().map(|w| w.id);
    let active_client = HyprClientData::get_active()
        .ok()
        .flatten()
        .map(|c| c.address.to_string());

    prune_urgent(&mut internal_state.urgent, &clients, active_client.as_deref());

    Ok(HyprSnapshot {
        monitors,
        workspaces,
        clients,
        active_workspace_id,
        active_client,
        urgent: internal_state.urgent.clone(),
    })
}

/// Urgency ends once the client is focused or gone.
fn prune_urgent(urgent: &mut HashSet<String>, clients: &[HyprClient], active: Option<&str>) {
    urgent.retain(|address| {
        Some(address.as_str()) != active && clients.iter().any(|c| &c.address == address)
    });
}

/// Projects a raw snapshot onto the unified types.
///
/// Dangling references (a workspace on a monitor that is gone, a client on a
/// deleted workspace) are logged and read as "unknown" instead of failing.
pub fn translate(snapshot: &HyprSnapshot) -> CompositorState {
    let monitors = snapshot
        .monitors
        .iter()
        .filter(|m| {
            if m.name.is_empty() {
                warn!("Skipping a Hyprland monitor without a name");
            }
            !m.name.is_empty()
        })
        .map(|m| Monitor {
            name: m.name.clone(),
            width: m.width.into(),
            height: m.height.into(),
            x: m.x,
            y: m.y,
            scale: sanitize_scale(m.scale.into()),
            focused: m.focused,
        })
        .collect::<Vec<_>>();

    let monitor_name = |name: &str, owner: &str| -> String {
        if monitors.iter().any(|m| m.name == name) {
            name.to_owned()
        } else {
            warn!("{owner} references monitor {name:?} which is no longer available");
            String::new()
        }
    };

    let workspaces = snapshot
        .workspaces
        .iter()
        .filter(|w| !WorkspaceId::Number(w.id.into()).is_special())
        .map(|w| Workspace {
            id: WorkspaceId::Number(w.id.into()),
            name: w.name.clone(),
            focused: Some(w.id) == snapshot.active_workspace_id,
            occupied: w.windows > 0,
            urgent: snapshot
                .clients
                .iter()
                .any(|c| c.workspace_id == w.id && snapshot.urgent.contains(&c.address)),
            monitor: monitor_name(&w.monitor, &format!("Workspace {}", w.id)),
        })
        .collect::<Vec<_>>();

    let focused_workspace = snapshot.active_workspace_id.and_then(|id| {
        let found = workspaces
            .iter()
            .find(|w| w.id == WorkspaceId::Number(id.into()))
            .cloned();
        if found.is_none() && !WorkspaceId::Number(id.into()).is_special() {
            warn!("Active workspace {id} is no longer available");
        }
        found
    });

    let clients = snapshot
        .clients
        .iter()
        .map(|c| {
            let workspace = snapshot.workspaces.iter().find(|w| w.id == c.workspace_id);
            if workspace.is_none() {
                warn!(
                    "Client {} references workspace {} which is no longer available",
                    c.address, c.workspace_id
                );
            }

            Client {
                address: c.address.clone(),
                title: c.title.clone(),
                class: c.class.clone(),
                workspace: workspace
                    .map(|w| WorkspaceId::Number(w.id.into()))
                    .filter(|id| !id.is_special()),
                monitor: workspace
                    .map(|w| monitor_name(&w.monitor, &format!("Client {}", c.address)))
                    .unwrap_or_default(),
                floating: c.floating,
                fullscreen: c.fullscreen,
                focused: snapshot.active_client.as_deref() == Some(c.address.as_str()),
            }
        })
        .collect::<Vec<_>>();

    let focused_client = clients.iter().find(|c| c.focused).cloned();
    if focused_client.is_none()
        && let Some(address) = &snapshot.active_client
    {
        debug!("Active client {address} is not in the client list yet");
    }

    CompositorState {
        focused_monitor: monitors.iter().find(|m| m.focused).cloned(),
        monitors,
        focused_workspace,
        workspaces,
        focused_client,
        clients,
    }
}
