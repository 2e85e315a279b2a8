//! End-to-end tests for the selection surface: picker replies, restore
//! tokens and the crop geometry they drive. Everything here runs without a
//! compositor or bus.

use hyprcast::dbus::screencast::{build_restore_value, parse_restore_data};
use hyprcast::picker::{parse_selection, selection_from_restore, RestoreData};
use hyprcast::render::{logical_box, physical_crop, Box2};
use hyprcast::session::{Selection, SelectionKind};
use hyprcast::wayland::outputs::OutputRegistry;
use hyprcast::wayland::toplevel::ToplevelRegistry;

use smithay::utils::Transform;

/// Scenario: picker reply `[SELECTION]r/screen:HDMI-A-1` carries the
/// restore flag and the output name through to the selection.
#[test]
fn test_full_output_selection_flow() {
    let toplevels = ToplevelRegistry::default();
    let selection = parse_selection("[SELECTION]r/screen:HDMI-A-1\n", &toplevels);

    assert_eq!(selection.kind, SelectionKind::Output);
    assert_eq!(selection.output, "HDMI-A-1");
    assert!(selection.allow_token);

    // The Start response token for this selection must round-trip back into
    // a restore payload naming the same output.
    let value = build_restore_value(&selection, 2).unwrap();
    let restore = parse_restore_data(&value).unwrap();
    assert_eq!(restore.output, "HDMI-A-1");
    assert_eq!(restore.with_cursor, 2);
}

/// Scenario: a region selection with transform maps to a physical crop that
/// stays inside the buffer and round-trips through the forward transform.
#[test]
fn test_region_with_transform_crop() {
    let toplevels = ToplevelRegistry::default();
    let selection =
        parse_selection("[SELECTION]rt/region:HDMI-A-1@100,200,640,480", &toplevels);

    assert_eq!(selection.kind, SelectionKind::Geometry);
    assert!(selection.needs_transform);

    // 90-degree output backed by a 1920x1080 physical frame.
    let rect = Box2::new(selection.x, selection.y, selection.w, selection.h);
    let physical = physical_crop(Transform::_90, rect, 1920, 1080);

    assert!(physical.x >= 0 && physical.y >= 0);
    assert!(physical.x + physical.w <= 1920);
    assert!(physical.y + physical.h <= 1080);
    // The crop is the region rotated back into the buffer.
    assert_eq!((physical.w, physical.h), (480, 640));
    assert_eq!(logical_box(Transform::_90, physical, 1920, 1080), rect);
}

/// Scenario: a restore token for a vanished output falls back to prompting
/// (signalled here by `None`).
#[test]
fn test_restore_token_requires_live_target() {
    let restore = RestoreData {
        output: "HDMI-A-1".into(),
        with_cursor: 1,
        token: "cafebabe".into(),
        time_issued: 12345,
        ..Default::default()
    };

    let outputs = OutputRegistry::default();
    let toplevels = ToplevelRegistry::default();
    assert!(selection_from_restore(&restore, &outputs, &toplevels).is_none());
}

/// Scenario: window capture needs a resolvable toplevel; an unknown handle
/// leaves the selection windowless, which SelectSources rejects.
#[test]
fn test_window_selection_without_export() {
    let toplevels = ToplevelRegistry::default();
    let selection = parse_selection("[SELECTION]/window:12345678", &toplevels);

    assert_eq!(selection.kind, SelectionKind::Window);
    assert!(selection.window.is_none());
    assert!(!selection.allow_token);
}

/// An emitted restore token is always re-acceptable as input (issuer and
/// version match what we parse).
#[test]
fn test_issued_tokens_parse_back() {
    for (kind, output, class) in [
        (SelectionKind::Output, "DP-3", ""),
        (SelectionKind::Geometry, "eDP-1", ""),
        (SelectionKind::Window, "", "firefox"),
    ] {
        let selection = Selection {
            kind,
            output: output.into(),
            window_class: class.into(),
            allow_token: true,
            ..Default::default()
        };
        let value = build_restore_value(&selection, 1).unwrap();
        let restore = parse_restore_data(&value).expect("own tokens must parse");
        assert_eq!(restore.output, output);
        assert_eq!(restore.window_class, class);
        assert!(!restore.token.is_empty());
    }
}
