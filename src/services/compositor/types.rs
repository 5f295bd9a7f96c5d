use std::{fmt, ops::RangeInclusive};

/// Hyprland keeps special (scratchpad) workspaces in this id range.
pub const SPECIAL_WORKSPACE_IDS: RangeInclusive<i64> = -99..=-2;

/// Number of tags River exposes per output.
pub const TAG_COUNT: u32 = 9;

#[derive(Debug, Clone, PartialEq)]
pub struct Monitor {
    /// Connector name, e.g. `DP-1`. Unique among live monitors.
    pub name: String,
    pub width: i32,
    pub height: i32,
    pub x: i32,
    pub y: i32,
    pub scale: f64,
    pub focused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkspaceId {
    Number(i64),
    Name(String),
}

impl WorkspaceId {
    pub fn as_number(&self) -> Option<i64> {
        match self {
            WorkspaceId::Number(id) => Some(*id),
            WorkspaceId::Name(name) => name.parse().ok(),
        }
    }

    pub fn is_special(&self) -> bool {
        matches!(self, WorkspaceId::Number(id) if SPECIAL_WORKSPACE_IDS.contains(id))
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceId::Number(id) => write!(f, "{id}"),
            WorkspaceId::Name(name) => f.write_str(name),
        }
    }
}

impl From<i64> for WorkspaceId {
    fn from(value: i64) -> Self {
        WorkspaceId::Number(value)
    }
}

impl From<&str> for WorkspaceId {
    fn from(value: &str) -> Self {
        WorkspaceId::Name(value.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub focused: bool,
    pub occupied: bool,
    pub urgent: bool,
    /// Name of the monitor showing this workspace, empty when unknown.
    pub monitor: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    /// Opaque compositor handle; empty when the compositor has none.
    pub address: String,
    pub title: String,
    pub class: String,
    pub workspace: Option<WorkspaceId>,
    pub monitor: String,
    pub floating: bool,
    pub fullscreen: bool,
    pub focused: bool,
}

/// One whole-state snapshot in the unified vocabulary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompositorState {
    pub monitors: Vec<Monitor>,
    pub focused_monitor: Option<Monitor>,
    pub workspaces: Vec<Workspace>,
    pub focused_workspace: Option<Workspace>,
    pub clients: Vec<Client>,
    pub focused_client: Option<Client>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompositorCommand {
    FocusWorkspace(WorkspaceId),
    MoveClientToWorkspace {
        address: String,
        workspace: WorkspaceId,
    },
}

/// Tag mask of River tag `tag` (1-based).
pub fn tag_mask(tag: u32) -> u32 {
    1 << (tag - 1)
}

/// Inverse of [`tag_mask`] for single-bit masks.
pub fn mask_to_tag(mask: u32) -> Option<u32> {
    (mask.count_ones() == 1).then(|| mask.trailing_zeros() + 1)
}

/// Keeps scale finite so equal snapshots stay equal.
pub fn sanitize_scale(scale: f64) -> f64 {
    if scale.is_finite() && scale > 0.0 {
        scale
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_mask_round_trips_for_every_tag() {
        for tag in 1..=TAG_COUNT {
            let mask = tag_mask(tag);
            assert_eq!(mask_to_tag(mask), Some(tag));
            assert_eq!((mask as f64).log2() as u32 + 1, tag);
        }
    }

    #[test]
    fn multi_bit_masks_have_no_single_tag() {
        assert_eq!(mask_to_tag(0), None);
        assert_eq!(mask_to_tag(0b101), None);
    }

    #[test]
    fn special_ids_are_the_reserved_negative_range() {
        assert!(WorkspaceId::Number(-99).is_special());
        assert!(WorkspaceId::Number(-2).is_special());
        assert!(!WorkspaceId::Number(-1).is_special());
        assert!(!WorkspaceId::Number(-1337).is_special());
        assert!(!WorkspaceId::Number(1).is_special());
        assert!(!WorkspaceId::Name("-5".into()).is_special());
    }

    #[test]
    fn scale_nan_is_replaced() {
        assert_eq!(sanitize_scale(f64::NAN), 1.0);
        assert_eq!(sanitize_scale(0.0), 1.0);
        assert_eq!(sanitize_scale(1.5), 1.5);
    }
}
