//! Legacy control endpoints
//!
//! Responses are plain `;`-separated text. Queries come either as `key=value`
//! pairs or in the bare form (`/changeip?1001`, `/screenon?set?true`).

use axum::extract::{RawQuery, State};
use tracing::{debug, info, warn};

use crate::api::AppState;

pub const WRONG_URL: &str = "WRONG_URL";
pub const BAD_REQUEST: &str = "Bad request";

/// Remaining-quota field the companion app expects in `/changeip` replies
const CHANGE_IP_QUOTA: u32 = 10000;

/// What `/screenon` was asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenCommand {
    Check,
    Set(bool),
}

/// Value of `key` in a `key=value&...` query
fn query_value<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// Instance ID from `id=<n>` or a bare `<n>`
pub fn parse_instance_id(query: Option<&str>) -> Option<u32> {
    let query = query?;
    let value = query_value(query, "id").unwrap_or(query);
    value.trim().parse().ok()
}

pub fn parse_screen_command(query: Option<&str>) -> Option<ScreenCommand> {
    let query = query?.trim();
    if query.eq_ignore_ascii_case("check") || query_value(query, "check").is_some() {
        return Some(ScreenCommand::Check);
    }

    let value = query_value(query, "set")
        .or_else(|| query.strip_prefix("set?"))
        .or_else(|| query.strip_prefix("set="))?;
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "on" => Some(ScreenCommand::Set(true)),
        "false" | "0" | "off" => Some(ScreenCommand::Set(false)),
        _ => None,
    }
}

/// Modem number for a reply; pool errors become an empty field
async fn number_field(state: &AppState, id: u32) -> String {
    match state.pool.subscriber_number(id).await {
        Ok(number) => number,
        Err(e) => {
            debug!(id, kind = %e.kind(), "No subscriber number: {}", e);
            String::new()
        }
    }
}

/// `/changeip`: queue a rotation and answer with the modem's number
pub async fn change_ip(State(state): State<AppState>, RawQuery(query): RawQuery) -> String {
    let Some(id) = parse_instance_id(query.as_deref()) else {
        return BAD_REQUEST.to_string();
    };

    info!(id, "Rotation requested over control API");
    let number = number_field(&state, id).await;
    state.pool.enqueue_rotation(id, false);

    format!("OK;{};{}", CHANGE_IP_QUOTA, number)
}

/// `/getmobilenumber`
pub async fn mobile_number(State(state): State<AppState>, RawQuery(query): RawQuery) -> String {
    let Some(id) = parse_instance_id(query.as_deref()) else {
        return BAD_REQUEST.to_string();
    };

    format!("OK;{}", number_field(&state, id).await)
}

/// `/screenon`
pub async fn screen_on(State(state): State<AppState>, RawQuery(query): RawQuery) -> String {
    match parse_screen_command(query.as_deref()) {
        Some(ScreenCommand::Check) => screen_label(state.screen.is_enabled()).to_string(),
        Some(ScreenCommand::Set(enabled)) => match state.screen.set(enabled).await {
            Ok(()) => format!("OK;{}", screen_label(enabled)),
            Err(e) => {
                warn!("Failed to persist screen state: {}", e);
                BAD_REQUEST.to_string()
            }
        },
        None => BAD_REQUEST.to_string(),
    }
}

fn screen_label(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

/// `/proxylist`: every instance ID, bound or idle
pub async fn proxy_list(State(state): State<AppState>) -> String {
    let mut body = String::from("AVAIL");
    for id in state.pool.ids() {
        body.push(';');
        body.push_str(&id.to_string());
    }
    body
}

/// `/nighttransfer`
pub async fn night_transfer(State(state): State<AppState>) -> &'static str {
    let now = chrono::Local::now().time();
    match state.night_window {
        Some(window) if window.contains(now) => "allowed",
        _ => "wait",
    }
}

pub async fn wrong_url() -> &'static str {
    WRONG_URL
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use tokio::sync::watch;
    use tower::ServiceExt;

    use crate::api::routes::create_router;
    use crate::config::Config;
    use crate::modem::StaticModemProvider;
    use crate::proxy::instance::tests::{test_context, ScriptedProbe};
    use crate::proxy::rotation::RotationPhase;
    use crate::proxy::{ProxyPool, RotationRequest};
    use crate::services::{NightWindow, ScreenSwitch};

    struct Harness {
        pool: Arc<ProxyPool>,
        provider: Arc<StaticModemProvider>,
        app: Router,
        _shutdown: watch::Sender<bool>,
    }

    fn harness(control_port: u16, screen_path: &str, answers: &[Ipv4Addr]) -> Harness {
        let provider = Arc::new(StaticModemProvider::new());
        let mut config = Config::default();
        config.control.port = control_port;
        config.proxy.host = "127.0.0.1".to_string();

        let (ctx, shutdown) = test_context(config, provider.clone(), Arc::new(ScriptedProbe::new(answers)));
        let pool = Arc::new(ProxyPool::new(ctx));
        let state = AppState {
            pool: pool.clone(),
            screen: Arc::new(ScreenSwitch::load(std::env::temp_dir().join(screen_path))),
            night_window: None,
            started_at: Instant::now(),
        };

        Harness {
            pool,
            provider,
            app: create_router(state),
            _shutdown: shutdown,
        }
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
        send(app, Method::GET, uri).await
    }

    async fn send(app: &Router, method: Method, uri: &str) -> (StatusCode, String) {
        let response = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_parse_instance_id_forms() {
        assert_eq!(parse_instance_id(Some("1001")), Some(1001));
        assert_eq!(parse_instance_id(Some("id=1002")), Some(1002));
        assert_eq!(parse_instance_id(Some("foo=1&id=1003")), Some(1003));
        assert_eq!(parse_instance_id(Some("id=abc")), None);
        assert_eq!(parse_instance_id(None), None);
    }

    #[test]
    fn test_parse_screen_command_forms() {
        assert_eq!(parse_screen_command(Some("check")), Some(ScreenCommand::Check));
        assert_eq!(parse_screen_command(Some("set?true")), Some(ScreenCommand::Set(true)));
        assert_eq!(parse_screen_command(Some("set=false")), Some(ScreenCommand::Set(false)));
        assert_eq!(parse_screen_command(Some("set=maybe")), None);
        assert_eq!(parse_screen_command(Some("")), None);
        assert_eq!(parse_screen_command(None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_ip_answers_and_rotates() {
        let h = harness(
            47400,
            "rota-modem-api-changeip",
            &[Ipv4Addr::new(198, 51, 100, 1), Ipv4Addr::new(198, 51, 100, 2)],
        );
        h.provider
            .insert("wwan0", Some(Ipv4Addr::new(10, 0, 0, 1)), Some("+15550100".to_string()));
        h.provider.script_addresses("wwan0", &[Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 3)]);
        h.pool.refresh().await.unwrap();

        let worker_pool = h.pool.clone();
        let (_worker_shutdown, worker_rx) = watch::channel(false);
        tokio::spawn(async move { worker_pool.run_queue_worker(worker_rx).await });

        // Let the startup rotation finish and the debounce window lapse.
        tokio::time::sleep(Duration::from_secs(40)).await;
        let instance = h.pool.get(47401).unwrap();
        assert_eq!(instance.phase(), RotationPhase::Active);
        assert_eq!(h.provider.disconnect_count(), 1);

        let (status, body) = get(&h.app, "/changeip?47401").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK;10000;+15550100");

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.provider.disconnect_count(), 2);
        assert_eq!(instance.phase(), RotationPhase::Active);
        assert_eq!(instance.address(), Some(Ipv4Addr::new(10, 0, 0, 3)));
    }

    #[tokio::test]
    async fn test_unknown_instance_gets_empty_number() {
        let h = harness(47500, "rota-modem-api-unknown", &[]);

        assert_eq!(get(&h.app, "/changeip?id=9999").await.1, "OK;10000;");
        assert_eq!(h.pool.queue().drain(), vec![RotationRequest::new(9999, false)]);

        assert_eq!(get(&h.app, "/getmobilenumber?9999").await.1, "OK;");
        assert_eq!(get(&h.app, "/changeip?nope").await.1, BAD_REQUEST);
        assert!(h.pool.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_proxy_list_and_mobile_number() {
        let h = harness(47600, "rota-modem-api-list", &[]);
        assert_eq!(get(&h.app, "/proxylist").await.1, "AVAIL");

        h.provider.insert("wwan0", Some(Ipv4Addr::new(10, 0, 0, 1)), Some("+15550111".to_string()));
        h.provider.insert("wwan1", Some(Ipv4Addr::new(10, 0, 0, 2)), None);
        h.pool.refresh().await.unwrap();

        assert_eq!(get(&h.app, "/proxylist").await.1, "AVAIL;47601;47602");
        assert_eq!(get(&h.app, "/getmobilenumber?47601").await.1, "OK;+15550111");
        assert_eq!(get(&h.app, "/getmobilenumber?id=47602").await.1, "OK;Unknown");
    }

    #[tokio::test]
    async fn test_screen_switch_round_trip() {
        let name = format!("rota-modem-api-screen-{}", std::process::id());
        let path = std::env::temp_dir().join(&name);
        let _ = std::fs::remove_file(&path);
        let h = harness(47700, &name, &[]);

        assert_eq!(get(&h.app, "/screenon?check").await.1, "enabled");
        assert_eq!(get(&h.app, "/screenon?set?false").await.1, "OK;disabled");
        assert!(path.exists());
        assert_eq!(get(&h.app, "/screenon?check").await.1, "disabled");
        assert_eq!(get(&h.app, "/screenon?set=true").await.1, "OK;enabled");
        assert!(!path.exists());
        assert_eq!(get(&h.app, "/screenon?bogus").await.1, BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_control_routes_accept_any_method() {
        let h = harness(47550, "rota-modem-api-methods", &[]);

        let (status, body) = send(&h.app, Method::POST, "/changeip?1001").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK;10000;");
        assert_eq!(h.pool.queue().drain(), vec![RotationRequest::new(1001, false)]);

        assert_eq!(send(&h.app, Method::POST, "/proxylist").await, (StatusCode::OK, "AVAIL".to_string()));
        assert_eq!(send(&h.app, Method::PUT, "/getmobilenumber?1001").await.1, "OK;");
        assert_eq!(send(&h.app, Method::PUT, "/nope").await.1, WRONG_URL);
    }

    #[tokio::test]
    async fn test_night_transfer_and_fallback() {
        let h = harness(47800, "rota-modem-api-night", &[]);
        assert_eq!(get(&h.app, "/nighttransfer").await.1, "wait");
        assert_eq!(get(&h.app, "/nope").await.1, WRONG_URL);
    }

    #[tokio::test]
    async fn test_night_transfer_inside_window() {
        let h = harness(47900, "rota-modem-api-night-open", &[]);
        let mut state = AppState {
            pool: h.pool.clone(),
            screen: Arc::new(ScreenSwitch::load(std::env::temp_dir().join("rota-modem-api-night-open"))),
            night_window: None,
            started_at: Instant::now(),
        };

        // A window starting one minute from now and wrapping around excludes only
        // the current minute.
        let now = chrono::Local::now().time();
        let start = now + chrono::Duration::minutes(1);
        let end = now - chrono::Duration::minutes(1);
        state.night_window = Some(NightWindow::new(start, end));
        assert_eq!(night_transfer(State(state.clone())).await, "wait");

        state.night_window = Some(NightWindow::new(end, start));
        assert_eq!(night_transfer(State(state)).await, "allowed");
    }
}
