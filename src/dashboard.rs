//! Read-only HTML view of the alert store.

use crate::alerts::{AlertKind, AlertRecord, AlertStore};
use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use html_escape::encode_text;
use std::fmt::Write;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub fn router(store: AlertStore) -> Router {
    Router::new().route("/", get(index)).with_state(store)
}

async fn index(State(store): State<AlertStore>) -> Html<String> {
    let alerts = store.snapshot();
    log::info!("Dashboard requested, serving {} alert(s)", alerts.len());
    Html(render_page(&alerts))
}

/// Serves the dashboard until `shutdown` resolves.
pub async fn serve(
    store: AlertStore,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, store, shutdown).await
}

pub async fn serve_on(
    listener: TcpListener,
    store: AlertStore,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    log::info!("Dashboard listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

const STYLE: &str = "body{font-family:sans-serif;margin:2em;background:#f6f7f9;color:#222}\
.alert{background:#fff;border-left:6px solid #999;padding:1em;margin-bottom:1em}\
.alert.recipient{border-color:#e0a800}.alert.data{border-color:#d9534f}\
.meta{color:#666;font-size:.9em}ul{margin:.5em 0 0 1em;padding:0}";

pub fn render_page(alerts: &[Arc<AlertRecord>]) -> String {
    let mut html = String::with_capacity(1024 + alerts.len() * 256);
    html.push_str("<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">");
    html.push_str("<meta http-equiv=\"refresh\" content=\"15\">");
    html.push_str("<title>Sent Mail Alerts</title><style>");
    html.push_str(STYLE);
    html.push_str("</style></head><body><h1>Sent Mail Alerts</h1>\n");

    if alerts.is_empty() {
        html.push_str("<p class=\"empty\">No alerts yet.</p>\n");
    }
    for alert in alerts {
        render_alert(&mut html, alert);
    }

    html.push_str("</body></html>\n");
    html
}

fn render_alert(html: &mut String, alert: &AlertRecord) {
    let (class, title) = match alert.kind() {
        AlertKind::Recipient => ("recipient", "Suspicious recipients"),
        AlertKind::Data => ("data", "Sensitive data"),
    };
    // Writing to a String cannot fail.
    let _ = write!(
        html,
        "<div class=\"alert {class}\"><h2>{title}</h2><p><strong>Subject:</strong> {}</p>",
        encode_text(alert.subject())
    );
    if let Some(filename) = alert.filename() {
        let _ = write!(
            html,
            "<p><strong>Attachment:</strong> {}</p>",
            encode_text(filename)
        );
    }
    let _ = write!(
        html,
        "<p class=\"meta\">{} &middot; {}</p><ul>",
        alert.kind(),
        alert.detected_at().format("%Y-%m-%d %H:%M:%S UTC")
    );
    for finding in alert.findings() {
        html.push_str("<li>");
        let parts: Vec<String> = finding
            .fields()
            .iter()
            .map(|(key, value)| {
                format!(
                    "<strong>{}:</strong> {}",
                    encode_text(key),
                    encode_text(value)
                )
            })
            .collect();
        html.push_str(&parts.join(", "));
        html.push_str("</li>");
    }
    html.push_str("</ul></div>\n");
}
