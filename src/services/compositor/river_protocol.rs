//! Wayland protocol bindings for River's status and control interfaces.
//!
//! Generated from the protocol XML files at compile time.

#![allow(dead_code, non_camel_case_types, unused_unsafe, unused_variables)]
#![allow(non_upper_case_globals, non_snake_case, unused_imports)]
#![allow(missing_docs, clippy::all)]

pub mod status {
    use wayland_client;
    use wayland_client::protocol::*;

    pub mod __interfaces {
        use wayland_client::backend as wayland_backend;
        use wayland_client::protocol::__interfaces::*;
        wayland_scanner::generate_interfaces!("protocols/river-status-unstable-v1.xml");
    }

    use self::__interfaces::*;

    wayland_scanner::generate_client_code!("protocols/river-status-unstable-v1.xml");
}

pub mod control {
    use wayland_client;
    use wayland_client::protocol::*;

    pub mod __interfaces {
        use wayland_client::backend as wayland_backend;
        use wayland_client::protocol::__interfaces::*;
        wayland_scanner::generate_interfaces!("protocols/river-control-unstable-v1.xml");
    }

    use self::__interfaces::*;

    wayland_scanner::generate_client_code!("protocols/river-control-unstable-v1.xml");
}

pub use control::{
    zriver_command_callback_v1::{self, ZriverCommandCallbackV1},
    zriver_control_v1::ZriverControlV1,
};
pub use status::{
    zriver_output_status_v1::{self, ZriverOutputStatusV1},
    zriver_seat_status_v1::{self, ZriverSeatStatusV1},
    zriver_status_manager_v1::ZriverStatusManagerV1,
};
