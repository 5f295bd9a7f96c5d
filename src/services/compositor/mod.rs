pub mod detector;
pub mod hyprland;
pub mod matcher;
pub mod river;
mod river_protocol;
pub mod types;

pub use self::detector::{CompositorChoice, DetectError, detect};
pub use self::matcher::{ToolkitMonitor, match_monitor};
pub use self::types::*;

use self::{hyprland::HyprlandAdapter, river::RiverAdapter};
use crate::reactive::{Accessor, Live, Signal};
use itertools::Itertools;
use log::{debug, info};

/// Live view over the unified compositor state.
///
/// Owned by an adapter, which is the only writer. Every update is a whole
/// [`CompositorState`] snapshot; unchanged collections do not notify.
pub struct CompositorService {
    monitors: Live<Vec<Monitor>>,
    focused_monitor: Live<Option<Monitor>>,
    workspaces: Live<Vec<Workspace>>,
    focused_workspace: Live<Option<Workspace>>,
    clients: Live<Vec<Client>>,
    focused_client: Live<Option<Client>>,
    monitor_added: Signal<Monitor>,
    monitor_removed: Signal<String>,
}

impl CompositorService {
    pub fn new(state: CompositorState) -> Self {
        Self {
            monitors: Live::new(state.monitors),
            focused_monitor: Live::new(state.focused_monitor),
            workspaces: Live::new(state.workspaces),
            focused_workspace: Live::new(state.focused_workspace),
            clients: Live::new(state.clients),
            focused_client: Live::new(state.focused_client),
            monitor_added: Signal::new(),
            monitor_removed: Signal::new(),
        }
    }

    /// Publishes a new snapshot, then reports monitors that disappeared or
    /// appeared compared to the previous one (removals first).
    pub fn update(&self, state: CompositorState) {
        let previous = self.monitors.accessor().get();

        self.monitors.set(state.monitors.clone());
        self.focused_monitor.set(state.focused_monitor);
        self.workspaces.set(state.workspaces);
        self.focused_workspace.set(state.focused_workspace);
        self.clients.set(state.clients);
        self.focused_client.set(state.focused_client);

        let removed = previous
            .iter()
            .filter(|old| !state.monitors.iter().any(|new| new.name == old.name))
            .map(|old| old.name.clone())
            .collect_vec();
        let added = state
            .monitors
            .iter()
            .filter(|new| !previous.iter().any(|old| old.name == new.name))
            .cloned()
            .collect_vec();

        for name in removed {
            debug!("Compositor removed monitor {name}");
            self.monitor_removed.emit(&name);
        }
        for monitor in added {
            debug!("Compositor added monitor {}", monitor.name);
            self.monitor_added.emit(&monitor);
        }
    }

    pub fn monitors(&self) -> Accessor<Vec<Monitor>> {
        self.monitors.accessor()
    }

    pub fn focused_monitor(&self) -> Accessor<Option<Monitor>> {
        self.focused_monitor.accessor()
    }

    pub fn workspaces(&self) -> Accessor<Vec<Workspace>> {
        self.workspaces.accessor()
    }

    pub fn focused_workspace(&self) -> Accessor<Option<Workspace>> {
        self.focused_workspace.accessor()
    }

    pub fn clients(&self) -> Accessor<Vec<Client>> {
        self.clients.accessor()
    }

    pub fn focused_client(&self) -> Accessor<Option<Client>> {
        self.focused_client.accessor()
    }

    pub fn monitor_added(&self) -> Signal<Monitor> {
        self.monitor_added.clone()
    }

    pub fn monitor_removed(&self) -> Signal<String> {
        self.monitor_removed.clone()
    }
}

/// The compositor the shell is running under. Exactly two are supported.
pub enum Compositor {
    River(RiverAdapter),
    Hyprland(HyprlandAdapter),
}

impl Compositor {
    pub fn name(&self) -> &'static str {
        match self {
            Compositor::River(_) => river::NAME,
            Compositor::Hyprland(_) => hyprland::NAME,
        }
    }

    pub fn is_available(&self) -> bool {
        match self {
            Compositor::River(adapter) => adapter.is_available(),
            Compositor::Hyprland(adapter) => adapter.is_available(),
        }
    }

    pub fn service(&self) -> &CompositorService {
        match self {
            Compositor::River(adapter) => adapter.service(),
            Compositor::Hyprland(adapter) => adapter.service(),
        }
    }

    pub fn monitors(&self) -> Accessor<Vec<Monitor>> {
        self.service().monitors()
    }

    pub fn focused_monitor(&self) -> Accessor<Option<Monitor>> {
        self.service().focused_monitor()
    }

    pub fn workspaces(&self) -> Accessor<Vec<Workspace>> {
        self.service().workspaces()
    }

    pub fn focused_workspace(&self) -> Accessor<Option<Workspace>> {
        self.service().focused_workspace()
    }

    pub fn clients(&self) -> Accessor<Vec<Client>> {
        self.service().clients()
    }

    pub fn focused_client(&self) -> Accessor<Option<Client>> {
        self.service().focused_client()
    }

    /// Best effort: a rejected command is logged, never returned.
    pub fn focus_workspace(&self, id: impl Into<WorkspaceId>) {
        self.command(CompositorCommand::FocusWorkspace(id.into()));
    }

    /// Best effort: a rejected command is logged, never returned.
    pub fn move_client_to_workspace(&self, address: &str, workspace: impl Into<WorkspaceId>) {
        self.command(CompositorCommand::MoveClientToWorkspace {
            address: address.to_owned(),
            workspace: workspace.into(),
        });
    }

    pub fn command(&self, command: CompositorCommand) {
        debug!("{} command: {command:?}", self.name());
        match self {
            Compositor::River(adapter) => adapter.execute(command),
            Compositor::Hyprland(adapter) => adapter.execute(command),
        }
    }

    pub fn match_monitor<M: ToolkitMonitor + Clone>(
        &self,
        monitor: &Monitor,
        candidates: &[M],
    ) -> Option<M> {
        match_monitor(monitor, candidates)
    }

    /// Follows compositor notifications until the backend goes away.
    pub async fn listen(&self) -> anyhow::Result<()> {
        info!("Listening to {} events", self.name());
        match self {
            Compositor::River(adapter) => adapter.listen().await,
            Compositor::Hyprland(adapter) => adapter.listen().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    fn monitor(name: &str) -> Monitor {
        Monitor {
            name: name.to_owned(),
            width: 1920,
            height: 1080,
            x: 0,
            y: 0,
            scale: 1.0,
            focused: false,
        }
    }

    fn with_monitors(names: &[&str]) -> CompositorState {
        CompositorState {
            monitors: names.iter().map(|name| monitor(name)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn update_reports_monitor_diff_removals_first() {
        let service = CompositorService::new(with_monitors(&["DP-1", "HDMI-1"]));
        let events = Rc::new(RefCell::new(Vec::new()));
        let _added = service.monitor_added().connect({
            let events = events.clone();
            move |m: &Monitor| events.borrow_mut().push(format!("+{}", m.name))
        });
        let _removed = service.monitor_removed().connect({
            let events = events.clone();
            move |name: &String| events.borrow_mut().push(format!("-{name}"))
        });

        service.update(with_monitors(&["HDMI-1", "eDP-1"]));

        assert_eq!(*events.borrow(), vec!["-DP-1", "+eDP-1"]);
    }

    #[test]
    fn identical_snapshot_notifies_nobody() {
        let service = CompositorService::new(with_monitors(&["DP-1"]));
        let hits = Rc::new(RefCell::new(0));
        let _sub = service.monitors().subscribe({
            let hits = hits.clone();
            move |_| *hits.borrow_mut() += 1
        });
        let _added = service.monitor_added().connect({
            let hits = hits.clone();
            move |_| *hits.borrow_mut() += 1
        });

        service.update(with_monitors(&["DP-1"]));

        assert_eq!(*hits.borrow(), 0);
    }

    #[test]
    fn subscribers_see_the_new_collection_when_a_monitor_is_added() {
        let service = Rc::new(CompositorService::new(CompositorState::default()));
        let seen = Rc::new(RefCell::new(0));
        let _added = service.monitor_added().connect({
            let service = service.clone();
            let seen = seen.clone();
            move |_| *seen.borrow_mut() = service.monitors().get().len()
        });

        service.update(with_monitors(&["DP-1", "HDMI-1"]));

        assert_eq!(*seen.borrow(), 2);
    }
}
