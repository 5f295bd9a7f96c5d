use crate::{
    config::{Appearance, BarConfig},
    outputs::SurfaceBuilder,
    reactive::{Accessor, Scope},
    services::compositor::{Monitor, Workspace},
    toolkit::{LayerSurface, OutputHandle, Toolkit},
};
use hex_color::HexColor;
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagState {
    Focused,
    Urgent,
    Occupied,
    Empty,
}

impl TagState {
    fn of(workspace: &Workspace) -> Self {
        if workspace.focused {
            TagState::Focused
        } else if workspace.urgent {
            TagState::Urgent
        } else if workspace.occupied {
            TagState::Occupied
        } else {
            TagState::Empty
        }
    }

    fn color(self, appearance: &Appearance) -> HexColor {
        match self {
            TagState::Focused => appearance.focused,
            TagState::Urgent => appearance.urgent,
            TagState::Occupied => appearance.occupied,
            TagState::Empty => appearance.empty,
        }
    }
}

/// Tag states of the workspaces shown on `monitor`, in workspace order.
pub fn tag_states(workspaces: &[Workspace], monitor: &str) -> Vec<TagState> {
    workspaces
        .iter()
        .filter(|w| w.monitor == monitor)
        .map(TagState::of)
        .collect()
}

fn colors(states: &[TagState], appearance: &Appearance) -> Vec<HexColor> {
    states.iter().map(|state| state.color(appearance)).collect()
}

/// Builds the tag strip for one monitor. The strip follows the workspaces of
/// its monitor through a derived accessor owned by the surface's scope.
pub fn builder(
    toolkit: &Toolkit,
    workspaces: Accessor<Vec<Workspace>>,
    bar: BarConfig,
    appearance: Appearance,
) -> SurfaceBuilder<OutputHandle, LayerSurface> {
    let toolkit = toolkit.clone();

    Box::new(
        move |monitor: &Monitor, output: &OutputHandle, scope: &mut Scope| {
            let name = monitor.name.clone();
            let states = workspaces.map(scope, move |workspaces| tag_states(workspaces, &name));

            let surface = toolkit.create_surface(
                output,
                &bar,
                appearance.background,
                colors(&states.get(), &appearance),
            )?;

            let painter = surface.painter();
            let appearance = appearance.clone();
            let name = monitor.name.clone();
            scope.add(states.subscribe(move |states| {
                debug!("Repainting tags of {name}");
                painter.paint(colors(states, &appearance));
            }));

            Ok(surface)
        },
    )
}
