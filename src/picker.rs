//! Selection provider: the external picker process and restore tokens.
//!
//! The picker is a child process that prints a single
//! `[SELECTION]<flags>/<spec>` line. Restore tokens short-circuit it when the
//! referenced output or window still exists.

use std::process::Command;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::session::{Selection, SelectionKind};
use crate::wayland::outputs::OutputRegistry;
use crate::wayland::toplevel::ToplevelRegistry;

const SELECTION_MARKER: &str = "[SELECTION]";
const QPA_PLUGIN_ERROR: &str = "qt.qpa.plugin: Could not find the Qt platform plugin";

/// Restore payload as carried on the bus, independent of wire version.
#[derive(Debug, Clone, Default)]
pub struct RestoreData {
    pub token: String,
    pub output: String,
    pub window_handle: u64,
    pub window_class: String,
    pub with_cursor: u32,
    pub time_issued: u64,
}

/// Reconstruct a selection from a restore token. `None` when the referenced
/// target no longer exists, in which case the caller falls back to the
/// picker.
pub fn selection_from_restore(
    restore: &RestoreData,
    outputs: &OutputRegistry,
    toplevels: &ToplevelRegistry,
) -> Option<Selection> {
    let output_alive = !restore.output.is_empty() && outputs.by_name(&restore.output).is_some();
    let window_alive = !restore.window_class.is_empty()
        && toplevels.handle_from_class(&restore.window_class).is_some();

    if !output_alive && !window_alive {
        return None;
    }

    let window = window_alive.then(|| {
        let by_token = (restore.window_handle != 0)
            .then(|| toplevels.handle_from_token(restore.window_handle))
            .flatten();
        by_token
            .or_else(|| toplevels.handle_from_class(&restore.window_class))
            .map(|entry| entry.handle.clone())
    });

    Some(Selection {
        kind: if window_alive { SelectionKind::Window } else { SelectionKind::Output },
        output: restore.output.clone(),
        window: window.flatten(),
        window_class: restore.window_class.clone(),
        // The user allowed a token when this one was issued.
        allow_token: true,
        ..Default::default()
    })
}

/// Invoke the picker child and parse its reply. An invalid selection is
/// returned for every failure mode; the portal call then completes with
/// response=1.
pub fn prompt(config: &Config, toplevels: &ToplevelRegistry, has_toplevel_export: bool) -> Selection {
    let binary = if config.screencopy.custom_picker_binary.is_empty() {
        "hyprland-share-picker"
    } else {
        &config.screencopy.custom_picker_binary
    };

    let mut command = Command::new(binary);
    if config.screencopy.allow_token_by_default {
        command.arg("--allow-token");
    }
    command
        .env("WAYLAND_DISPLAY", std::env::var("WAYLAND_DISPLAY").unwrap_or_default())
        .env("QT_QPA_PLATFORM", "wayland")
        .env("XCURSOR_SIZE", std::env::var("XCURSOR_SIZE").unwrap_or_else(|_| "24".into()))
        .env(
            "HYPRLAND_INSTANCE_SIGNATURE",
            std::env::var("HYPRLAND_INSTANCE_SIGNATURE").unwrap_or_else(|_| "0".into()),
        )
        .env(
            "XDPH_WINDOW_SHARING_LIST",
            build_window_list(toplevels, has_toplevel_export),
        );

    let output = match command.output() {
        Ok(output) => output,
        Err(err) => {
            warn!("failed to spawn picker {binary}: {err}");
            return Selection::default();
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !stdout.contains(SELECTION_MARKER) {
        if stdout.contains(QPA_PLUGIN_ERROR) || stderr.contains(QPA_PLUGIN_ERROR) {
            notify(
                3,
                7000,
                "Could not open the picker: qt5-wayland or qt6-wayland doesn't seem to be installed.",
            );
        }
        return Selection::default();
    }

    parse_selection(&stdout, toplevels)
}

/// Parse a `[SELECTION]<flags>/<spec>` reply.
pub fn parse_selection(reply: &str, toplevels: &ToplevelRegistry) -> Selection {
    let Some(index) = reply.find(SELECTION_MARKER) else {
        return Selection::default();
    };
    let body = reply[index + SELECTION_MARKER.len()..].trim();

    let Some((flags, spec)) = body.split_once('/') else {
        return Selection::default();
    };

    debug!("picker selection: {body}");

    let mut selection = Selection::default();
    for flag in flags.chars() {
        match flag {
            'r' => selection.allow_token = true,
            't' => selection.needs_transform = true,
            other => info!("unknown flag from share picker: {other}"),
        }
    }

    if let Some(output) = spec.strip_prefix("screen:") {
        selection.kind = SelectionKind::Output;
        selection.output = output.trim().to_string();
    } else if let Some(handle) = spec.strip_prefix("window:") {
        selection.kind = SelectionKind::Window;
        if let Ok(lower) = handle.trim().parse::<u32>() {
            if let Some(entry) = toplevels.handle_from_token_lower(lower) {
                selection.window = Some(entry.handle.clone());
                selection.window_class = entry.class.clone();
            }
        }
        if selection.needs_transform {
            warn!("transform forced on a window; not supported, ignoring");
            selection.needs_transform = false;
        }
    } else if let Some(region) = spec.strip_prefix("region:") {
        let Some((output, rect)) = region.split_once('@') else {
            return Selection::default();
        };
        let parts: Vec<i32> = rect
            .trim()
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect();
        let [x, y, w, h] = parts.as_slice() else {
            return Selection::default();
        };
        selection.kind = SelectionKind::Geometry;
        selection.output = output.to_string();
        selection.x = *x;
        selection.y = *y;
        selection.w = *w;
        selection.h = *h;
    }

    selection
}

/// Delimited window list handed to the picker:
/// `token[HC>]class[HT>]title[HE>]address[HA>]` per entry, with shell-active
/// characters stripped from user-controlled strings.
pub fn build_window_list(toplevels: &ToplevelRegistry, has_toplevel_export: bool) -> String {
    if !has_toplevel_export {
        return String::new();
    }

    let mut list = String::new();
    for entry in &toplevels.toplevels {
        list.push_str(&format!(
            "{}[HC>]{}[HT>]{}[HE>]{}[HA>]",
            (entry.token() & 0xFFFF_FFFF) as u32,
            sanitize_name(&entry.class),
            sanitize_name(&entry.title),
            toplevels.address_for(&entry.handle),
        ));
    }
    list
}

/// Strip quoting/expansion characters and break `>]` sequences so a title
/// can't smuggle delimiters into the list.
pub fn sanitize_name(name: &str) -> String {
    let mut result: Vec<char> = name
        .chars()
        .map(|c| match c {
            '\'' | '"' | '$' | '`' => ' ',
            other => other,
        })
        .collect();
    for i in 1..result.len() {
        if result[i - 1] == '>' && result[i] == ']' {
            result[i] = ' ';
        }
    }
    result.into_iter().collect()
}

/// Raise a compositor notification through hyprctl.
pub fn notify(icon: u32, time_ms: u32, message: &str) {
    let result = Command::new("hyprctl")
        .arg("notify")
        .arg(icon.to_string())
        .arg(time_ms.to_string())
        .arg("0")
        .arg(format!("[hyprcast] {message}"))
        .spawn();
    if let Err(err) = result {
        warn!("failed to send notification: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_toplevels() -> ToplevelRegistry {
        ToplevelRegistry::default()
    }

    #[test]
    fn test_parse_screen_selection() {
        let selection = parse_selection("[SELECTION]r/screen:HDMI-A-1\n", &no_toplevels());
        assert_eq!(selection.kind, SelectionKind::Output);
        assert_eq!(selection.output, "HDMI-A-1");
        assert!(selection.allow_token);
        assert!(!selection.needs_transform);
    }

    #[test]
    fn test_parse_region_selection_with_transform() {
        let selection =
            parse_selection("[SELECTION]rt/region:HDMI-A-1@100,200,640,480\n", &no_toplevels());
        assert_eq!(selection.kind, SelectionKind::Geometry);
        assert_eq!(selection.output, "HDMI-A-1");
        assert_eq!((selection.x, selection.y), (100, 200));
        assert_eq!((selection.w, selection.h), (640, 480));
        assert!(selection.allow_token);
        assert!(selection.needs_transform);
    }

    #[test]
    fn test_parse_window_selection_unknown_handle() {
        // No toplevels known: the kind survives but the handle is unset, so
        // SelectSources will fail the call.
        let selection = parse_selection("[SELECTION]/window:12345678\n", &no_toplevels());
        assert_eq!(selection.kind, SelectionKind::Window);
        assert!(selection.window.is_none());
    }

    #[test]
    fn test_parse_window_drops_transform_flag() {
        let selection = parse_selection("[SELECTION]t/window:42\n", &no_toplevels());
        assert!(!selection.needs_transform);
    }

    #[test]
    fn test_parse_garbage_is_invalid() {
        assert_eq!(parse_selection("no marker here", &no_toplevels()).kind, SelectionKind::Invalid);
        assert_eq!(parse_selection("[SELECTION]nonsense", &no_toplevels()).kind, SelectionKind::Invalid);
        assert_eq!(
            parse_selection("[SELECTION]r/region:HDMI-A-1@1,2,3", &no_toplevels()).kind,
            SelectionKind::Invalid
        );
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("plain title"), "plain title");
        assert_eq!(sanitize_name("a'b\"c$d`e"), "a b c d e");
        assert_eq!(sanitize_name("evil>]title"), "evil> title");
    }

    #[test]
    fn test_restore_rejected_when_target_gone() {
        let restore = RestoreData {
            output: "HDMI-A-1".into(),
            with_cursor: 1,
            token: "todo".into(),
            ..Default::default()
        };
        let outputs = OutputRegistry::default();
        assert!(selection_from_restore(&restore, &outputs, &no_toplevels()).is_none());
    }

    #[test]
    fn test_restore_rejected_when_empty() {
        let restore = RestoreData::default();
        assert!(selection_from_restore(&restore, &OutputRegistry::default(), &no_toplevels()).is_none());
    }
}
