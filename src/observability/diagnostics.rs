//! Startup banner and route table.

use std::fmt::Write as _;
use std::io::{self, IsTerminal, Write as _};

use colored::{ColoredString, Colorize};

use crate::config::ResolvedStartConfig;
use crate::http::{App, RouteInfo};
use crate::net::listener::split_host_port;

const MIN_INNER_WIDTH: usize = 45;
const PIDS_PER_LINE: usize = 6;

#[derive(Clone, Copy)]
enum Style {
    Title,
    Link,
    Muted,
    Plain,
}

struct Line {
    text: String,
    centered: bool,
    style: Style,
}

impl Line {
    fn centered(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            centered: true,
            style,
        }
    }

    fn left(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            centered: false,
            style: Style::Plain,
        }
    }
}

/// Everything the banner shows.
#[derive(Debug, Clone)]
pub struct StartupMessage<'a> {
    pub app_name: Option<&'a str>,
    /// `host:port` as given to the listener, or the bound address.
    pub addr: &'a str,
    pub tls: bool,
    pub handlers: usize,
    pub processes: usize,
    pub prefork: bool,
    pub pid: u32,
    pub child_pids: &'a [u32],
}

impl StartupMessage<'_> {
    /// Render the banner. With `color` off the output holds no escape codes.
    pub fn render(&self, color: bool) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        let (host, port) = split_host_port(self.addr).unwrap_or((self.addr, ""));
        let (display_host, bound_host) = match host {
            "" | "0.0.0.0" => ("127.0.0.1", Some("0.0.0.0")),
            "::" => ("::1", Some("::")),
            other => (other, None),
        };
        let link_host = if display_host.contains(':') {
            format!("[{display_host}]")
        } else {
            display_host.to_string()
        };

        let mut lines = vec![Line::centered(
            self.app_name.unwrap_or(env!("CARGO_PKG_NAME")),
            Style::Title,
        )];
        lines.push(Line::centered(
            concat!("v", env!("CARGO_PKG_VERSION")),
            Style::Muted,
        ));
        lines.push(Line::centered(format!("{scheme}://{link_host}:{port}"), Style::Link));
        if let Some(bound) = bound_host {
            lines.push(Line::centered(
                format!("(bound on host {bound} and port {port})"),
                Style::Muted,
            ));
        }
        lines.push(Line::left(""));
        lines.push(Line::left(dotted("Handlers", self.handlers)));
        lines.push(Line::left(dotted("Processes", self.processes)));
        lines.push(Line::left(dotted(
            "Prefork",
            if self.prefork { "Enabled" } else { "Disabled" },
        )));
        lines.push(Line::left(dotted("PID", self.pid)));

        if !self.child_pids.is_empty() {
            for (index, chunk) in self.child_pids.chunks(PIDS_PER_LINE).enumerate() {
                let pids = chunk.iter().map(u32::to_string).collect::<Vec<_>>().join(", ");
                let label = if index == 0 { "Child PIDs" } else { "" };
                lines.push(Line::left(dotted(label, pids)));
            }
        }

        boxed(&lines, color)
    }
}

fn dotted(label: &str, value: impl std::fmt::Display) -> String {
    if label.is_empty() {
        return format!("{:>width$}", value, width = 16);
    }
    let value = value.to_string();
    let dots = 18usize.saturating_sub(label.len() + value.len()).max(3);
    format!("{label} {} {value}", ".".repeat(dots))
}

fn boxed(lines: &[Line], color: bool) -> String {
    let inner = lines
        .iter()
        .map(|line| line.text.chars().count())
        .max()
        .unwrap_or(0)
        .max(MIN_INNER_WIDTH);

    let mut out = String::new();
    let _ = writeln!(out, "┌{}┐", "─".repeat(inner + 2));
    for line in lines {
        let len = line.text.chars().count();
        let (left, right) = if line.centered {
            let left = (inner - len) / 2;
            (left, inner - len - left)
        } else {
            (0, inner - len)
        };
        let _ = writeln!(
            out,
            "│ {}{}{} │",
            " ".repeat(left),
            paint(&line.text, line.style, color),
            " ".repeat(right)
        );
    }
    let _ = writeln!(out, "└{}┘", "─".repeat(inner + 2));
    out
}

fn paint(text: &str, style: Style, color: bool) -> String {
    if !color {
        return text.to_string();
    }
    let painted: ColoredString = match style {
        Style::Title => text.bold(),
        Style::Link => text.cyan(),
        Style::Muted => text.dimmed(),
        Style::Plain => text.normal(),
    };
    painted.to_string()
}

/// Render the route table, sorted by path then method.
pub fn render_routes(routes: &[RouteInfo], color: bool) -> String {
    let mut routes: Vec<&RouteInfo> = routes.iter().collect();
    routes.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.method.as_str().cmp(b.method.as_str())));

    let method_width = routes
        .iter()
        .map(|r| r.method.as_str().len())
        .chain(["method".len()])
        .max()
        .unwrap_or(0);
    let path_width = routes
        .iter()
        .map(|r| r.path.len())
        .chain(["path".len()])
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    let header = format!("{:<method_width$} | {:<path_width$} | handler", "method", "path");
    let rule = format!(
        "{} | {} | {}",
        "-".repeat(method_width),
        "-".repeat(path_width),
        "-".repeat("handler".len())
    );
    if color {
        let _ = writeln!(out, "{}", header.bold());
        let _ = writeln!(out, "{}", rule.dimmed());
    } else {
        let _ = writeln!(out, "{header}");
        let _ = writeln!(out, "{rule}");
    }

    for route in routes {
        let method = format!("{:<method_width$}", route.method.as_str());
        let path = format!("{:<path_width$}", route.path);
        if color {
            let _ = writeln!(out, "{} | {} | {}", method.blue(), path.cyan(), route.handler.green());
        } else {
            let _ = writeln!(out, "{method} | {path} | {}", route.handler);
        }
    }
    out
}

/// Whether stdout should get ANSI colour.
pub fn color_enabled() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if std::env::var("TERM").is_ok_and(|term| term == "dumb") {
        return false;
    }
    io::stdout().is_terminal()
}

/// Print the banner and route table as configured. Prefork children print nothing.
pub fn print_startup(
    app: &App,
    addr: &str,
    tls: bool,
    config: &ResolvedStartConfig,
    child_pids: &[u32],
) {
    if config.role.is_prefork_child() {
        return;
    }

    let color = color_enabled();
    let mut output = String::new();

    if !config.disable_startup_message {
        let message = StartupMessage {
            app_name: app.app_name(),
            addr,
            tls,
            handlers: app.handlers_count(),
            processes: if config.enable_prefork { child_pids.len() } else { 1 },
            prefork: config.enable_prefork,
            pid: std::process::id(),
            child_pids,
        };
        output.push_str(&message.render(color));
    }

    if config.enable_print_routes {
        output.push_str(&render_routes(&app.routes(), color));
    }

    if output.is_empty() {
        return;
    }

    let mut stdout = io::stdout().lock();
    if let Err(e) = stdout.write_all(output.as_bytes()).and_then(|()| stdout.flush()) {
        tracing::debug!(error = %e, "Failed to write startup diagnostics");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    fn message<'a>(addr: &'a str, child_pids: &'a [u32]) -> StartupMessage<'a> {
        StartupMessage {
            app_name: Some("demo"),
            addr,
            tls: false,
            handlers: 3,
            processes: child_pids.len().max(1),
            prefork: !child_pids.is_empty(),
            pid: 4242,
            child_pids,
        }
    }

    #[test]
    fn banner_for_wildcard_host() {
        let banner = message(":3000", &[]).render(false);

        assert!(banner.contains("demo"));
        assert!(banner.contains("http://127.0.0.1:3000"));
        assert!(banner.contains("(bound on host 0.0.0.0 and port 3000)"));
        assert!(banner.contains("Handlers"));
        assert!(banner.contains("Disabled"));
        assert!(banner.contains("4242"));
        assert!(!banner.contains('\u{1b}'));
    }

    #[test]
    fn banner_lines_share_one_width() {
        let pids: Vec<u32> = (100..110).collect();
        let banner = message("[::1]:8443", &pids).render(false);

        let widths: Vec<usize> = banner.lines().map(|l| l.chars().count()).collect();
        assert!(widths.windows(2).all(|w| w[0] == w[1]), "{banner}");
        assert!(banner.contains("http://[::1]:8443"));
        assert!(!banner.contains("bound on host"));
        assert!(banner.contains("Child PIDs"));
        assert!(banner.contains("109"));
    }

    #[test]
    fn tls_banner_uses_https() {
        let mut msg = message("127.0.0.1:443", &[]);
        msg.tls = true;
        assert!(msg.render(false).contains("https://127.0.0.1:443"));
    }

    #[test]
    fn route_table_is_sorted_and_plain() {
        let routes = vec![
            RouteInfo {
                method: Method::POST,
                path: "/users".into(),
                handler: "create_user".into(),
            },
            RouteInfo {
                method: Method::GET,
                path: "/".into(),
                handler: "index".into(),
            },
            RouteInfo {
                method: Method::GET,
                path: "/users".into(),
                handler: "list_users".into(),
            },
        ];

        let table = render_routes(&routes, false);
        let lines: Vec<&str> = table.lines().collect();

        assert!(lines[0].starts_with("method"));
        assert!(lines[2].contains("index"));
        assert!(lines[3].starts_with("GET "));
        assert!(lines[3].contains("list_users"));
        assert!(lines[4].starts_with("POST"));
        assert!(!table.contains('\u{1b}'));
    }
}
