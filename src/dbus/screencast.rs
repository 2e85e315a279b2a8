//! The `org.freedesktop.impl.portal.ScreenCast` interface and its payloads.

use std::collections::HashMap;

use calloop::channel::Sender;
use rand::Rng as _;
use tracing::{debug, info};
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};
use zbus::{interface, ObjectServer};

use super::{
    forward, register_request, unregister_request, PortalError, PortalRequest, SelectSourcesOptions,
    SessionObject,
};
use crate::picker::RestoreData;
use crate::session::{Selection, SelectionKind, CURSOR_EMBEDDED, CURSOR_HIDDEN};
use crate::session::{SOURCE_MONITOR, SOURCE_VIRTUAL, SOURCE_WINDOW};
use crate::utils::unix_time;
use crate::{RESTORE_TOKEN_ISSUER, RESTORE_TOKEN_VERSION};

type PortalResponse = Result<(u32, HashMap<String, OwnedValue>), PortalError>;

pub struct ScreenCastPortal {
    to_loop: Sender<PortalRequest>,
}

impl ScreenCastPortal {
    pub fn new(to_loop: Sender<PortalRequest>) -> Self {
        Self { to_loop }
    }
}

#[interface(name = "org.freedesktop.impl.portal.ScreenCast")]
impl ScreenCastPortal {
    async fn create_session(
        &self,
        request_handle: OwnedObjectPath,
        session_handle: OwnedObjectPath,
        app_id: String,
        _options: HashMap<String, OwnedValue>,
        #[zbus(object_server)] server: &ObjectServer,
    ) -> PortalResponse {
        info!(request = %request_handle, session = %session_handle, app_id, "CreateSession");

        register_request(server, request_handle.as_str()).await.map_err(zbus::Error::from)?;

        let session_object =
            SessionObject::new(session_handle.to_string(), self.to_loop.clone());
        server
            .at(session_handle.clone(), session_object)
            .await
            .map_err(PortalError::ZBus)?;

        let result = forward(&self.to_loop, |reply| PortalRequest::CreateSession {
            request_handle: request_handle.to_string(),
            session_handle: session_handle.to_string(),
            app_id,
            reply,
        });

        unregister_request(server, request_handle.as_str()).await;
        result
    }

    async fn select_sources(
        &self,
        request_handle: OwnedObjectPath,
        session_handle: OwnedObjectPath,
        app_id: String,
        options: HashMap<String, OwnedValue>,
        #[zbus(object_server)] server: &ObjectServer,
    ) -> PortalResponse {
        info!(request = %request_handle, session = %session_handle, app_id, "SelectSources");

        register_request(server, request_handle.as_str()).await.map_err(zbus::Error::from)?;

        let options = parse_select_sources_options(&options);
        let result = forward(&self.to_loop, |reply| PortalRequest::SelectSources {
            session_handle: session_handle.to_string(),
            options,
            reply,
        });

        unregister_request(server, request_handle.as_str()).await;
        result
    }

    async fn start(
        &self,
        request_handle: OwnedObjectPath,
        session_handle: OwnedObjectPath,
        app_id: String,
        parent_window: String,
        _options: HashMap<String, OwnedValue>,
        #[zbus(object_server)] server: &ObjectServer,
    ) -> PortalResponse {
        info!(
            request = %request_handle,
            session = %session_handle,
            app_id,
            parent_window,
            "Start"
        );

        register_request(server, request_handle.as_str()).await.map_err(zbus::Error::from)?;

        let result = forward(&self.to_loop, |reply| PortalRequest::Start {
            session_handle: session_handle.to_string(),
            reply,
        });

        unregister_request(server, request_handle.as_str()).await;
        result
    }

    #[zbus(property)]
    fn available_source_types(&self) -> u32 {
        SOURCE_MONITOR | SOURCE_WINDOW | SOURCE_VIRTUAL
    }

    #[zbus(property)]
    fn available_cursor_modes(&self) -> u32 {
        CURSOR_HIDDEN | CURSOR_EMBEDDED
    }

    #[zbus(property, name = "version")]
    fn version(&self) -> u32 {
        3
    }
}

/// Pick apart the SelectSources option map.
fn parse_select_sources_options(options: &HashMap<String, OwnedValue>) -> SelectSourcesOptions {
    let mut parsed = SelectSourcesOptions::default();

    for (key, value) in options {
        match key.as_str() {
            "cursor_mode" => {
                parsed.cursor_mode = u32::try_from(value).ok();
                debug!(cursor_mode = ?parsed.cursor_mode, "option cursor_mode");
            }
            "persist_mode" => {
                parsed.persist_mode = u32::try_from(value).ok();
                debug!(persist_mode = ?parsed.persist_mode, "option persist_mode");
            }
            "restore_data" => {
                parsed.restore = parse_restore_data(value);
            }
            other => debug!("unused option {other}"),
        }
    }

    parsed
}

/// Parse the `(suv)` restore tuple. Two payload versions are on the wire: a
/// positional `(susbt)` struct (v2) and an open `a{sv}` map (v3). Tokens
/// from other issuers or versions are ignored.
pub fn parse_restore_data(value: &OwnedValue) -> Option<RestoreData> {
    let Value::Structure(outer) = &**value else {
        return None;
    };
    let fields = outer.fields();
    let issuer = match fields.first() {
        Some(Value::Str(issuer)) => issuer.as_str().to_owned(),
        _ => return None,
    };
    let version = match fields.get(1) {
        Some(Value::U32(version)) => *version,
        _ => return None,
    };
    let payload = match fields.get(2) {
        Some(Value::Value(inner)) => inner.as_ref(),
        Some(other) => other,
        None => return None,
    };

    if issuer != RESTORE_TOKEN_ISSUER {
        info!("restore token from {issuer}, ignoring");
        return None;
    }
    if version != 2 && version != 3 {
        info!("restore token ver {version} unsupported, skipping");
        return None;
    }

    let mut restore = RestoreData::default();

    if version == 2 {
        let Value::Structure(payload) = payload else {
            return None;
        };
        let fields = payload.fields();
        restore.token = match fields.first() {
            Some(Value::Str(token)) => token.as_str().to_owned(),
            _ => return None,
        };
        restore.window_handle = match fields.get(1) {
            Some(Value::U32(handle)) => *handle as u64,
            _ => return None,
        };
        restore.output = match fields.get(2) {
            Some(Value::Str(output)) => output.as_str().to_owned(),
            _ => return None,
        };
        restore.with_cursor = match fields.get(3) {
            Some(Value::Bool(cursor)) => *cursor as u32,
            _ => return None,
        };
        restore.time_issued = match fields.get(4) {
            Some(Value::U64(time)) => *time,
            _ => return None,
        };
    } else {
        if !matches!(payload, Value::Dict(_)) {
            return None;
        }
        let map: HashMap<String, OwnedValue> = payload.try_clone().ok()?.try_into().ok()?;
        for (key, value) in &map {
            match key.as_str() {
                "output" => restore.output = String::try_from(value.try_clone().ok()?).ok()?,
                "windowHandle" => restore.window_handle = u64::try_from(value).ok()?,
                "windowClass" => {
                    restore.window_class = String::try_from(value.try_clone().ok()?).ok()?
                }
                "withCursor" => restore.with_cursor = u32::try_from(value).ok()?,
                "timeIssued" => restore.time_issued = u64::try_from(value).ok()?,
                "token" => restore.token = String::try_from(value.try_clone().ok()?).ok()?,
                other => debug!("restore token v3, unknown prop {other}"),
            }
        }
    }

    debug!(?restore, "parsed restore token");
    Some(restore)
}

/// The `(suv)` restore tuple for a Start response.
pub fn build_restore_value(selection: &Selection, cursor_mode: u32) -> Option<OwnedValue> {
    let mut payload: HashMap<&str, Value> = HashMap::new();
    match selection.kind {
        SelectionKind::Output | SelectionKind::Geometry => {
            payload.insert("output", Value::from(selection.output.clone()));
        }
        SelectionKind::Window => {
            let token = selection
                .window
                .as_ref()
                .map(|handle| {
                    use wayland_client::Proxy;
                    handle.id().protocol_id() as u64
                })
                .unwrap_or(0);
            payload.insert("windowHandle", Value::from(token));
            payload.insert("windowClass", Value::from(selection.window_class.clone()));
        }
        _ => return None,
    }
    payload.insert("timeIssued", Value::from(unix_time()));
    payload.insert("token", Value::from(new_token_cookie()));
    payload.insert("withCursor", Value::from(cursor_mode));

    let tuple = Value::new((
        Value::from(RESTORE_TOKEN_ISSUER),
        Value::from(RESTORE_TOKEN_VERSION),
        Value::Value(Box::new(Value::new(payload))),
    ));
    OwnedValue::try_from(tuple).ok()
}

/// The `streams a(ua{sv})` payload for a Start response.
pub fn build_streams_value(
    node_id: u32,
    width: u32,
    height: u32,
    source_type: u32,
) -> Option<OwnedValue> {
    let mut stream_data: HashMap<String, Value> = HashMap::new();
    stream_data.insert("position".into(), Value::new((0i32, 0i32)));
    stream_data.insert("size".into(), Value::new((width as i32, height as i32)));
    stream_data.insert("source_type".into(), Value::from(source_type));

    let streams: Vec<(u32, HashMap<String, Value>)> = vec![(node_id, stream_data)];
    OwnedValue::try_from(Value::new(streams)).ok()
}

/// Random cookie embedded in restore tokens; opaque to clients.
fn new_token_cookie() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streams_value_signature() {
        let value = build_streams_value(42, 1920, 1080, SOURCE_MONITOR).unwrap();
        assert_eq!(value.value_signature().to_string(), "a(ua{sv})");
    }

    #[test]
    fn test_restore_value_signature_and_round_trip() {
        let selection = Selection {
            kind: SelectionKind::Output,
            output: "HDMI-A-1".into(),
            allow_token: true,
            ..Default::default()
        };
        let value = build_restore_value(&selection, CURSOR_EMBEDDED).unwrap();
        assert_eq!(value.value_signature().to_string(), "(suv)");

        // What we emit must parse back as a valid v3 token.
        let restore = parse_restore_data(&value).unwrap();
        assert_eq!(restore.output, "HDMI-A-1");
        assert_eq!(restore.with_cursor, CURSOR_EMBEDDED);
        assert_eq!(restore.token.len(), 16);
        assert!(restore.time_issued > 0);
    }

    #[test]
    fn test_restore_value_window() {
        let selection = Selection {
            kind: SelectionKind::Window,
            window_class: "kitty".into(),
            allow_token: true,
            ..Default::default()
        };
        let value = build_restore_value(&selection, CURSOR_HIDDEN).unwrap();
        let restore = parse_restore_data(&value).unwrap();
        assert_eq!(restore.window_class, "kitty");
        assert!(restore.output.is_empty());
    }

    #[test]
    fn test_restore_value_invalid_selection() {
        let selection = Selection::default();
        assert!(build_restore_value(&selection, 0).is_none());
    }

    #[test]
    fn test_parse_restore_rejects_foreign_issuer() {
        let payload: HashMap<&str, Value> = HashMap::new();
        let tuple = Value::new((
            Value::from("gnome"),
            Value::from(3u32),
            Value::Value(Box::new(Value::new(payload))),
        ));
        let value = OwnedValue::try_from(tuple).unwrap();
        assert!(parse_restore_data(&value).is_none());
    }

    #[test]
    fn test_parse_restore_rejects_unknown_version() {
        let payload: HashMap<&str, Value> = HashMap::new();
        let tuple = Value::new((
            Value::from(RESTORE_TOKEN_ISSUER),
            Value::from(7u32),
            Value::Value(Box::new(Value::new(payload))),
        ));
        let value = OwnedValue::try_from(tuple).unwrap();
        assert!(parse_restore_data(&value).is_none());
    }
}
