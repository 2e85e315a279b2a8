//! Client bindings for the Hyprland vendor protocols, generated from the
//! XML under `resources/`. The toplevel-export interface references
//! `zwlr_foreign_toplevel_handle_v1`, so the wlr foreign-toplevel interfaces
//! are pulled into scope for the generated code.

#![allow(non_upper_case_globals)]

pub mod hyprland_toplevel_export_v1 {
    use wayland_client;
    #[allow(unused_imports)]
    use wayland_client::protocol::*;
    #[allow(unused_imports)]
    use wayland_protocols_wlr::foreign_toplevel::v1::client::*;

    pub mod __interfaces {
        use wayland_client::protocol::__interfaces::*;
        use wayland_protocols_wlr::foreign_toplevel::v1::client::__interfaces::*;
        wayland_scanner::generate_interfaces!("resources/hyprland-toplevel-export-v1.xml");
    }
    use self::__interfaces::*;

    wayland_scanner::generate_client_code!("resources/hyprland-toplevel-export-v1.xml");
}

pub mod hyprland_toplevel_mapping_v1 {
    use wayland_client;
    #[allow(unused_imports)]
    use wayland_client::protocol::*;
    #[allow(unused_imports)]
    use wayland_protocols_wlr::foreign_toplevel::v1::client::*;

    pub mod __interfaces {
        use wayland_client::protocol::__interfaces::*;
        use wayland_protocols_wlr::foreign_toplevel::v1::client::__interfaces::*;
        wayland_scanner::generate_interfaces!("resources/hyprland-toplevel-mapping-v1.xml");
    }
    use self::__interfaces::*;

    wayland_scanner::generate_client_code!("resources/hyprland-toplevel-mapping-v1.xml");
}
