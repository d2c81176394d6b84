use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use regex::Regex;
use tokio::process::Command;

use crate::action::types::DevicePoint;
use crate::config::DeviceConfig;
use crate::device::traits::{Actuation, DeviceActuator, Observer};
use crate::errors::{PilotError, PilotResult};
use crate::perception::frame::ScreenFrame;

const SWIPE_MS: u32 = 300;
const LONG_PRESS_MS: u32 = 800;
const KEYCODE_HOME: &str = "3";
const KEYCODE_BACK: &str = "4";
const UI_DUMP_PATH: &str = "/sdcard/window_dump.xml";

static CURRENT_FOCUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"mCurrentFocus=Window\{[^}]*?\s([A-Za-z0-9_.]+)/").expect("static regex")
});

static FOCUSED_APP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"mFocusedApp=.*?\s([A-Za-z0-9_.]+)/").expect("static regex")
});

static PACKAGE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.]+$").expect("static regex"));

static UI_NODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<node\b[^>]*>").expect("static regex"));

static NODE_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([\w-]+)="([^"]*)""#).expect("static regex"));

static BOUNDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(-?\d+),(-?\d+)\]\[(-?\d+),(-?\d+)\]").expect("static regex")
});

/// Observer and actuator backed by the `adb` command-line tool.
///
/// Text entry goes through the ADB Keyboard IME broadcast, which must be
/// installed and selected on the device.
pub struct AdbDevice {
    adb_path: String,
    serial: Option<String>,
    launch_wait: Duration,
    host_app: Option<String>,
}

impl AdbDevice {
    pub fn new(cfg: &DeviceConfig, host_app: Option<String>) -> Self {
        Self {
            adb_path: cfg.adb_path.clone(),
            serial: cfg.serial.clone(),
            launch_wait: Duration::from_millis(cfg.launch_wait_ms),
            host_app,
        }
    }

    async fn adb(&self, args: &[&str]) -> PilotResult<Vec<u8>> {
        let mut cmd = Command::new(&self.adb_path);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args).kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| PilotError::Device(format!("adb {}: {e}", args.join(" "))))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PilotError::Device(format!(
                "adb {} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn shell(&self, args: &[&str]) -> PilotResult<String> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        let out = self.adb(&full).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    async fn shell_action(&self, what: &str, args: &[&str]) -> Actuation {
        match self.shell(args).await {
            Ok(_) => Actuation::ok(),
            Err(e) => Actuation::failed(format!("{what}: {e}")),
        }
    }

    async fn getprop(&self, key: &str) -> String {
        self.shell(&["getprop", key])
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    async fn dump_ui(&self) -> PilotResult<String> {
        self.shell(&["uiautomator", "dump", UI_DUMP_PATH]).await?;
        self.shell(&["cat", UI_DUMP_PATH]).await
    }
}

#[async_trait]
impl Observer for AdbDevice {
    async fn screenshot(&self) -> Option<ScreenFrame> {
        let png = match self.adb(&["exec-out", "screencap", "-p"]).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "screencap failed");
                return None;
            }
        };
        match ScreenFrame::decode(&png) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!(error = %e, bytes = png.len(), "screencap output is not an image");
                None
            }
        }
    }

    async fn current_app(&self) -> Option<String> {
        match self.shell(&["dumpsys", "window"]).await {
            Ok(out) => parse_focused_package(&out),
            Err(e) => {
                tracing::warn!(error = %e, "dumpsys window failed");
                None
            }
        }
    }

    async fn is_emulator(&self) -> bool {
        if self
            .serial
            .as_deref()
            .is_some_and(|s| s.starts_with("emulator-"))
        {
            return true;
        }
        if self.getprop("ro.kernel.qemu").await == "1" {
            return true;
        }
        let model = self.getprop("ro.product.model").await.to_lowercase();
        model.contains("emulator") || model.contains("sdk")
    }
}

#[async_trait]
impl DeviceActuator for AdbDevice {
    async fn tap(&self, p: DevicePoint) -> Actuation {
        let (x, y) = p.rounded();
        self.shell_action("tap", &["input", "tap", &x.to_string(), &y.to_string()])
            .await
    }

    async fn long_press(&self, p: DevicePoint) -> Actuation {
        let (x, y) = p.rounded();
        let (x, y) = (x.to_string(), y.to_string());
        let ms = LONG_PRESS_MS.to_string();
        self.shell_action("long press", &["input", "swipe", &x, &y, &x, &y, &ms])
            .await
    }

    async fn swipe(&self, from: DevicePoint, to: DevicePoint) -> Actuation {
        let (x1, y1) = from.rounded();
        let (x2, y2) = to.rounded();
        let args = [x1, y1, x2, y2].map(|v| v.to_string());
        let ms = SWIPE_MS.to_string();
        self.shell_action(
            "swipe",
            &["input", "swipe", &args[0], &args[1], &args[2], &args[3], &ms],
        )
        .await
    }

    async fn set_text(&self, text: &str) -> Actuation {
        if let Err(e) = self
            .shell(&["am", "broadcast", "-a", "ADB_CLEAR_TEXT"])
            .await
        {
            return Actuation::failed(format!("clear text: {e}"));
        }
        let b64 = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
        self.shell_action(
            "type",
            &["am", "broadcast", "-a", "ADB_INPUT_B64", "--es", "msg", &b64],
        )
        .await
    }

    async fn back(&self) -> Actuation {
        self.shell_action("back", &["input", "keyevent", KEYCODE_BACK])
            .await
    }

    async fn home(&self) -> Actuation {
        self.shell_action("home", &["input", "keyevent", KEYCODE_HOME])
            .await
    }

    async fn launch(&self, app_id: &str) -> Actuation {
        // adb shell joins its arguments into one device command line.
        if !is_package_id(app_id) {
            return Actuation::failed(format!("app not found: {app_id}"));
        }
        let out = match self
            .shell(&[
                "monkey",
                "-p",
                app_id,
                "-c",
                "android.intent.category.LAUNCHER",
                "1",
            ])
            .await
        {
            Ok(out) => out,
            Err(e) => return Actuation::failed(format!("launch {app_id}: {e}")),
        };
        if out.contains("No activities found") || out.contains("monkey aborted") {
            return Actuation::failed(format!("app not found: {app_id}"));
        }
        tokio::time::sleep(self.launch_wait).await;
        Actuation::ok_with(format!("launched {app_id}"))
    }

    async fn find_by_label(&self, label: &str) -> Option<DevicePoint> {
        match self.dump_ui().await {
            Ok(xml) => find_label_center(&xml, label),
            Err(e) => {
                tracing::warn!(error = %e, "uiautomator dump failed");
                None
            }
        }
    }

    async fn bring_to_foreground(&self) {
        let Some(host) = &self.host_app else {
            tracing::debug!("no host app configured, nothing to bring forward");
            return;
        };
        let result = self.launch(host).await;
        if !result.success {
            tracing::warn!(host = %host, reason = %result.describe(), "could not return to host app");
        }
    }

    async fn resolve_installed(&self, app_name: &str) -> Option<String> {
        let out = self.shell(&["pm", "list", "packages"]).await.ok()?;
        match_installed(&parse_packages(&out), app_name)
    }
}

/// Package of the focused window in `dumpsys window` output.
pub fn parse_focused_package(dumpsys: &str) -> Option<String> {
    CURRENT_FOCUS
        .captures(dumpsys)
        .or_else(|| FOCUSED_APP.captures(dumpsys))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// `package:com.foo` lines → package names.
pub fn parse_packages(pm_output: &str) -> Vec<String> {
    pm_output
        .lines()
        .filter_map(|l| l.trim().strip_prefix("package:"))
        .map(str::to_string)
        .collect()
}

/// Installed package whose last segment equals the name (spaces removed,
/// case-insensitive), else the first one containing it.
pub fn match_installed(packages: &[String], app_name: &str) -> Option<String> {
    let needle: String = app_name
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    if needle.is_empty() || !needle.is_ascii() {
        return None;
    }
    packages
        .iter()
        .find(|p| p.rsplit('.').next().is_some_and(|last| last.to_lowercase() == needle))
        .or_else(|| packages.iter().find(|p| p.to_lowercase().contains(&needle)))
        .cloned()
}

/// Whether `app_id` is safe to pass to the device shell as a package name.
pub fn is_package_id(app_id: &str) -> bool {
    PACKAGE_ID.is_match(app_id)
}

/// Center of the first UI node whose `text` or `content-desc` equals the
/// label, falling back to the first that contains it.
pub fn find_label_center(xml: &str, label: &str) -> Option<DevicePoint> {
    let label = label.trim();
    if label.is_empty() {
        return None;
    }

    let nodes: Vec<(Vec<String>, String)> = UI_NODE
        .find_iter(xml)
        .filter_map(|node| {
            let mut labels = Vec::new();
            let mut bounds = None;
            for attr in NODE_ATTR.captures_iter(node.as_str()) {
                match &attr[1] {
                    "text" | "content-desc" => labels.push(unescape_xml(&attr[2])),
                    "bounds" => bounds = Some(attr[2].to_string()),
                    _ => {}
                }
            }
            bounds.map(|b| (labels, b))
        })
        .collect();

    let exact = nodes
        .iter()
        .find(|(labels, _)| labels.iter().any(|l| l == label));
    let partial = || {
        nodes
            .iter()
            .find(|(labels, _)| labels.iter().any(|l| !l.is_empty() && l.contains(label)))
    };
    let (_, bounds) = exact.or_else(partial)?;

    let c = BOUNDS.captures(bounds)?;
    let coord = |i: usize| c[i].parse::<f64>().ok();
    let (x1, y1, x2, y2) = (coord(1)?, coord(2)?, coord(3)?, coord(4)?);
    Some(DevicePoint::new((x1 + x2) / 2.0, (y1 + y2) / 2.0))
}

fn unescape_xml(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
