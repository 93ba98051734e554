//! Simulator control over an isolated CoreSimulator device set.
//!
//! All devices live in a private device set under the cache root so the
//! backend never touches the user's default simulators. Listing, creation
//! and deletion go through `xcrun simctl --set`; headless boot goes
//! through the companion binary, which keeps the device alive for as long
//! as the keepalive subprocess runs.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::{Mutex, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use which::which;

use crate::{
    error::{BackendError, Result},
    process::{self, CONTROL_TIMEOUT},
    protocol::DeviceSelection,
};

const DEFAULT_DEVICE_FILE: &str = "default-device";

/// A device in the isolated set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub udid: String,
    pub name: String,
    pub state: String,
    pub is_available: bool,
    pub device_type_id: String,
    pub runtime_id: String,
}

/// An installable device type as reported by `simctl list devicetypes`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceType {
    pub name: String,
    pub identifier: String,
    #[serde(default)]
    pub product_family: Option<String>,
}

/// A simulator runtime as reported by `simctl list runtimes`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Runtime {
    pub name: String,
    pub identifier: String,
    #[serde(default)]
    pub is_available: bool,
    #[serde(default)]
    pub supported_device_types: Vec<SupportedDeviceType>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SupportedDeviceType {
    pub identifier: String,
}

/// The device a stream ended up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub udid: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct DevicesPayload {
    devices: HashMap<String, Vec<DevicePayload>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DevicePayload {
    udid: String,
    name: String,
    state: String,
    #[serde(default)]
    is_available: bool,
    device_type_identifier: String,
}

#[derive(Debug, Deserialize)]
struct DeviceTypesPayload {
    devicetypes: Vec<DeviceType>,
}

#[derive(Debug, Deserialize)]
struct RuntimesPayload {
    runtimes: Vec<Runtime>,
}

/// `xcrun simctl` against the isolated device set.
#[derive(Debug, Clone)]
pub struct Simctl {
    xcrun: PathBuf,
    device_set: PathBuf,
}

impl Simctl {
    /// Locate `xcrun` and create the isolated device set directory.
    ///
    /// # Errors
    ///
    /// `ToolchainMissing` when `xcrun` is absent; IO errors when the
    /// device set cannot be created (unrecoverable at startup).
    pub fn new(device_set: PathBuf) -> Result<Self> {
        let xcrun = which("xcrun").map_err(|_| BackendError::ToolchainMissing {
            tool: "xcrun".into(),
        })?;
        std::fs::create_dir_all(&device_set)?;
        Ok(Self { xcrun, device_set })
    }

    #[must_use]
    pub fn device_set(&self) -> &Path {
        &self.device_set
    }

    fn simctl(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.xcrun);
        command
            .arg("simctl")
            .arg("--set")
            .arg(&self.device_set)
            .args(args)
            .stdin(Stdio::null());
        command
    }

    async fn simctl_json<T: serde::de::DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let output = process::output_with_timeout(&mut self.simctl(args), CONTROL_TIMEOUT).await?;
        if !output.status.success() {
            return Err(BackendError::Io(std::io::Error::other(format!(
                "simctl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| BackendError::Io(std::io::Error::other(format!("simctl JSON: {e}"))))
    }

    /// Devices currently present in the isolated set.
    ///
    /// # Errors
    ///
    /// Fails when simctl fails or emits unparseable JSON.
    pub async fn list(&self) -> Result<Vec<Device>> {
        let payload: DevicesPayload = self.simctl_json(&["list", "devices", "--json"]).await?;
        Ok(flatten_devices(payload))
    }

    /// Device types and runtimes installed on the host.
    ///
    /// # Errors
    ///
    /// Fails when simctl fails or emits unparseable JSON.
    pub async fn list_available(&self) -> Result<(Vec<DeviceType>, Vec<Runtime>)> {
        let types: DeviceTypesPayload =
            self.simctl_json(&["list", "devicetypes", "--json"]).await?;
        let runtimes: RuntimesPayload = self.simctl_json(&["list", "runtimes", "--json"]).await?;
        Ok((types.devicetypes, runtimes.runtimes))
    }

    /// Create a device of the given type/runtime with an auto-numbered
    /// name; returns its udid.
    ///
    /// # Errors
    ///
    /// Fails when simctl rejects the type/runtime pair.
    pub async fn add(&self, device_type_id: &str, runtime_id: &str) -> Result<String> {
        let (types, _) = self.list_available().await?;
        let base = types
            .iter()
            .find(|t| t.identifier == device_type_id)
            .map_or_else(|| base_name_from_identifier(device_type_id), |t| t.name.clone());
        let existing = self.list().await?;
        let names: Vec<&str> = existing.iter().map(|d| d.name.as_str()).collect();
        let name = format!("{base} ({})", next_sequence_number(&names, &base));

        let output = process::output_with_timeout(
            &mut self.simctl(&["create", &name, device_type_id, runtime_id]),
            CONTROL_TIMEOUT,
        )
        .await?;
        if !output.status.success() {
            return Err(BackendError::Io(std::io::Error::other(format!(
                "simctl create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Delete a device from the isolated set.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` when the udid is not in the set.
    pub async fn remove(&self, udid: &str) -> Result<()> {
        if !self.list().await?.iter().any(|d| d.udid == udid) {
            return Err(BackendError::DeviceNotFound(udid.into()));
        }
        let output =
            process::output_with_timeout(&mut self.simctl(&["delete", udid]), CONTROL_TIMEOUT)
                .await?;
        if !output.status.success() {
            return Err(BackendError::Io(std::io::Error::other(format!(
                "simctl delete failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        Ok(())
    }

    /// Shut a device down, tolerating the already-shutdown state.
    ///
    /// # Errors
    ///
    /// Only spawn/timeout failures; state conflicts are ignored.
    pub async fn shutdown_device(&self, udid: &str) -> Result<()> {
        let output =
            process::output_with_timeout(&mut self.simctl(&["shutdown", udid]), CONTROL_TIMEOUT)
                .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("current state: Shutdown") {
                warn!(udid, "simctl shutdown: {}", stderr.trim());
            }
        }
        Ok(())
    }

    /// Record the default device used when commands specify none.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` when the udid is not in the set.
    pub async fn set_default(&self, udid: &str) -> Result<()> {
        if !self.list().await?.iter().any(|d| d.udid == udid) {
            return Err(BackendError::DeviceNotFound(udid.into()));
        }
        std::fs::write(self.device_set.join(DEFAULT_DEVICE_FILE), udid)?;
        Ok(())
    }

    #[must_use]
    pub fn default_udid(&self) -> Option<String> {
        std::fs::read_to_string(self.device_set.join(DEFAULT_DEVICE_FILE))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Resolve the device a stream should run on.
    ///
    /// Order: explicit udid (must exist; never auto-created), a matching
    /// device for an explicit (type, runtime) pair (created on demand),
    /// the recorded default, the first existing device, and finally an
    /// auto-created device from the newest iPhone type and runtime.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` for a missing explicit udid, or any simctl
    /// failure along the way.
    pub async fn resolve(&self, selection: &DeviceSelection) -> Result<ResolvedDevice> {
        let devices = self.list().await?;

        if let Some(udid) = &selection.udid {
            return devices
                .iter()
                .find(|d| &d.udid == udid)
                .map(|d| ResolvedDevice { udid: d.udid.clone(), name: d.name.clone() })
                .ok_or_else(|| BackendError::DeviceNotFound(udid.clone()));
        }

        if let (Some(device_type_id), Some(runtime_id)) =
            (&selection.device_type_id, &selection.runtime_id)
        {
            if let Some(device) = devices.iter().find(|d| {
                &d.device_type_id == device_type_id && &d.runtime_id == runtime_id
            }) {
                return Ok(ResolvedDevice {
                    udid: device.udid.clone(),
                    name: device.name.clone(),
                });
            }
            let udid = self.add(device_type_id, runtime_id).await?;
            return self.lookup(&udid).await;
        }

        if let Some(default) = self.default_udid() {
            if let Some(device) = devices.iter().find(|d| d.udid == default) {
                return Ok(ResolvedDevice {
                    udid: device.udid.clone(),
                    name: device.name.clone(),
                });
            }
            debug!(%default, "recorded default device no longer exists");
        }

        if let Some(device) = devices.iter().find(|d| d.is_available) {
            return Ok(ResolvedDevice {
                udid: device.udid.clone(),
                name: device.name.clone(),
            });
        }

        let (types, runtimes) = self.list_available().await?;
        let (device_type_id, runtime_id) = choose_auto_create(&types, &runtimes)?;
        let udid = self.add(&device_type_id, &runtime_id).await?;
        self.lookup(&udid).await
    }

    async fn lookup(&self, udid: &str) -> Result<ResolvedDevice> {
        self.list()
            .await?
            .into_iter()
            .find(|d| d.udid == udid)
            .map(|d| ResolvedDevice { udid: d.udid, name: d.name })
            .ok_or_else(|| BackendError::DeviceNotFound(udid.into()))
    }

    /// Install the app bundle on a booted device.
    ///
    /// # Errors
    ///
    /// Fails when simctl rejects the bundle.
    pub async fn install_app(&self, udid: &str, app_bundle: &Path) -> Result<()> {
        let mut command = self.simctl(&["install", udid]);
        command.arg(app_bundle);
        let output = process::output_with_timeout(&mut command, CONTROL_TIMEOUT).await?;
        if !output.status.success() {
            return Err(BackendError::Io(std::io::Error::other(format!(
                "simctl install failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        Ok(())
    }

    /// Launch the host app with the injection environment pointing at the
    /// session's thunk directory. Any already-running instance is
    /// terminated first.
    ///
    /// # Errors
    ///
    /// Fails when simctl cannot launch the bundle.
    pub async fn launch_app(&self, udid: &str, bundle_id: &str, thunk_dir: &Path) -> Result<()> {
        let mut command = self.simctl(&["launch", "--terminate-running-process"]);
        command
            .env("SIMCTL_CHILD_AXE_THUNK_DIR", thunk_dir)
            .env(
                "SIMCTL_CHILD_AXE_THUNK_PATH",
                thunk_dir.join("current.dylib"),
            )
            .arg(udid)
            .arg(bundle_id);
        let output = process::output_with_timeout(&mut command, CONTROL_TIMEOUT).await?;
        if !output.status.success() {
            return Err(BackendError::Io(std::io::Error::other(format!(
                "simctl launch failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        Ok(())
    }

    /// Boot a device headlessly via the companion's boot-keepalive mode.
    ///
    /// The returned handle's `done` channel closes when the keepalive
    /// subprocess exits; callers must observe it to detect involuntary
    /// termination.
    ///
    /// # Errors
    ///
    /// `BootFailed` when no `Booted` report arrives within the control
    /// timeout or the keepalive exits first.
    pub async fn boot_headless(&self, companion: &Path, udid: &str) -> Result<BootHandle> {
        let mut child = Command::new(companion)
            .arg("--udid")
            .arg(udid)
            .arg("--device-set-path")
            .arg(&self.device_set)
            .arg("--boot")
            .arg("--headless")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::BootFailed(format!("failed to spawn companion: {e}")))?;

        let stdout = child.stdout.take().expect("stdout is piped");
        let mut lines = BufReader::new(stdout).lines();

        let booted = tokio::time::timeout(CONTROL_TIMEOUT, async {
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(udid, %line, "boot keepalive");
                let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
                    continue;
                };
                if value.get("state").and_then(serde_json::Value::as_str) == Some("Booted") {
                    return true;
                }
            }
            false
        })
        .await;

        match booted {
            Ok(true) => {}
            Ok(false) => {
                let detail = process::terminate(&mut child).await;
                return Err(BackendError::BootFailed(format!(
                    "keepalive exited before reporting Booted ({detail})"
                )));
            }
            Err(_) => {
                process::terminate(&mut child).await;
                return Err(BackendError::BootFailed(
                    "no Booted report within the control timeout".into(),
                ));
            }
        }

        let stop = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        let monitor_stop = stop.clone();
        let monitor_udid = udid.to_string();
        tokio::spawn(async move {
            // Keep draining stdout so the keepalive never blocks on a full
            // pipe.
            let drain = async {
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(udid = %monitor_udid, %line, "boot keepalive");
                }
            };
            tokio::pin!(drain);

            let detail = tokio::select! {
                () = monitor_stop.cancelled() => process::terminate(&mut child).await,
                () = &mut drain => {
                    match child.wait().await {
                        Ok(status) => process::exit_status_string(status),
                        Err(err) => err.to_string(),
                    }
                }
            };
            debug!(udid = %monitor_udid, %detail, "boot keepalive exited");
            let _ = done_tx.send(Some(detail));
        });

        Ok(BootHandle { udid: udid.to_string(), stop, done: done_rx })
    }
}

/// A headlessly booted device. Dropping the handle does not shut the
/// device down; call [`BootHandle::shutdown`].
#[derive(Debug)]
pub struct BootHandle {
    udid: String,
    stop: CancellationToken,
    done: watch::Receiver<Option<String>>,
}

impl BootHandle {
    #[must_use]
    pub fn udid(&self) -> &str {
        &self.udid
    }

    /// A receiver that yields the exit description once the keepalive
    /// subprocess exits.
    #[must_use]
    pub fn done_rx(&self) -> watch::Receiver<Option<String>> {
        self.done.clone()
    }

    /// Terminate the keepalive (shutting the device down) and wait for it
    /// to exit.
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        let _ = self.done.wait_for(Option::is_some).await;
    }
}

/// Wait on a cloned `done` receiver for the keepalive exit description.
pub async fn wait_done(rx: &mut watch::Receiver<Option<String>>) -> String {
    match rx.wait_for(Option::is_some).await {
        Ok(value) => value.clone().unwrap_or_default(),
        Err(_) => "keepalive monitor dropped".to_string(),
    }
}

/// Shares booted devices between streams: a device boots on first acquire
/// and shuts down when the last stream releases it.
#[derive(Debug)]
pub struct DeviceRegistry {
    simctl: Arc<Simctl>,
    companion: PathBuf,
    inner: Mutex<HashMap<String, DeviceEntry>>,
}

#[derive(Debug)]
struct DeviceEntry {
    refs: usize,
    handle: BootHandle,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new(simctl: Arc<Simctl>, companion: PathBuf) -> Self {
        Self { simctl, companion, inner: Mutex::new(HashMap::new()) }
    }

    /// Boot `udid` if it is not already held and return a `done` receiver
    /// for involuntary-exit detection.
    ///
    /// # Errors
    ///
    /// Propagates boot failures.
    pub async fn acquire(&self, udid: &str) -> Result<watch::Receiver<Option<String>>> {
        let mut map = self.inner.lock().await;
        if let Some(entry) = map.get_mut(udid) {
            entry.refs += 1;
            return Ok(entry.handle.done_rx());
        }
        let handle = self.simctl.boot_headless(&self.companion, udid).await?;
        let done = handle.done_rx();
        map.insert(udid.to_string(), DeviceEntry { refs: 1, handle });
        Ok(done)
    }

    /// Drop one reference; shuts the device down when it was the last.
    pub async fn release(&self, udid: &str) {
        let removed = {
            let mut map = self.inner.lock().await;
            let last = match map.get_mut(udid) {
                Some(entry) if entry.refs > 1 => {
                    entry.refs -= 1;
                    false
                }
                Some(_) => true,
                None => false,
            };
            if last { map.remove(udid) } else { None }
        };
        if let Some(entry) = removed {
            entry.handle.shutdown().await;
            let _ = self.simctl.shutdown_device(udid).await;
        }
    }
}

fn flatten_devices(payload: DevicesPayload) -> Vec<Device> {
    let mut runtime_ids: Vec<&String> = payload.devices.keys().collect();
    runtime_ids.sort();
    let mut devices = Vec::new();
    for runtime_id in runtime_ids {
        for device in &payload.devices[runtime_id] {
            devices.push(Device {
                udid: device.udid.clone(),
                name: device.name.clone(),
                state: device.state.clone(),
                is_available: device.is_available,
                device_type_id: device.device_type_identifier.clone(),
                runtime_id: runtime_id.clone(),
            });
        }
    }
    devices
}

/// Parse `(major, minor)` out of an iOS runtime identifier such as
/// `com.apple.CoreSimulator.SimRuntime.iOS-18-2`. Non-iOS runtimes yield
/// `None`.
#[must_use]
pub fn parse_ios_version(runtime_id: &str) -> Option<(u32, u32)> {
    let rest = runtime_id.rsplit('.').next()?;
    let rest = rest.strip_prefix("iOS-")?;
    let mut parts = rest.split('-');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map_or(Some(0), |m| m.parse().ok())?;
    Some((major, minor))
}

/// Next free auto-number for devices named `base (N)`.
#[must_use]
pub fn next_sequence_number(names: &[&str], base: &str) -> u32 {
    names
        .iter()
        .filter_map(|name| {
            let suffix = name.strip_prefix(base)?.trim_start();
            let n = suffix.strip_prefix('(')?.strip_suffix(')')?;
            n.parse::<u32>().ok()
        })
        .max()
        .map_or(1, |max| max + 1)
}

fn base_name_from_identifier(device_type_id: &str) -> String {
    device_type_id
        .rsplit('.')
        .next()
        .unwrap_or(device_type_id)
        .replace('-', " ")
}

/// The (device type, runtime) pair used for auto-creation: the
/// lexicographically-largest iPhone device type present in the newest
/// available iOS runtime.
fn choose_auto_create(types: &[DeviceType], runtimes: &[Runtime]) -> Result<(String, String)> {
    let newest = runtimes
        .iter()
        .filter(|r| r.is_available)
        .filter_map(|r| parse_ios_version(&r.identifier).map(|v| (v, r)))
        .max_by(|(va, ra), (vb, rb)| va.cmp(vb).then_with(|| ra.name.cmp(&rb.name)))
        .map(|(_, r)| r)
        .ok_or_else(|| BackendError::DeviceNotFound("no available iOS runtime".into()))?;

    let supported: Option<Vec<&str>> = if newest.supported_device_types.is_empty() {
        None
    } else {
        Some(
            newest
                .supported_device_types
                .iter()
                .map(|t| t.identifier.as_str())
                .collect(),
        )
    };

    let device_type = types
        .iter()
        .filter(|t| {
            t.product_family.as_deref() == Some("iPhone")
                || t.identifier.contains(".iPhone-")
        })
        .filter(|t| {
            supported
                .as_ref()
                .is_none_or(|s| s.contains(&t.identifier.as_str()))
        })
        .max_by(|a, b| a.identifier.cmp(&b.identifier))
        .ok_or_else(|| {
            BackendError::DeviceNotFound("no iPhone device type for the newest runtime".into())
        })?;

    Ok((device_type.identifier.clone(), newest.identifier.clone()))
}

#[cfg(test)]
mod tests {
    use super::{
        DeviceType, DevicesPayload, Runtime, SupportedDeviceType, choose_auto_create,
        flatten_devices, next_sequence_number, parse_ios_version,
    };

    #[test]
    fn parses_ios_runtime_versions() {
        assert_eq!(
            parse_ios_version("com.apple.CoreSimulator.SimRuntime.iOS-18-2"),
            Some((18, 2))
        );
        assert_eq!(
            parse_ios_version("com.apple.CoreSimulator.SimRuntime.iOS-17-0"),
            Some((17, 0))
        );
        assert_eq!(parse_ios_version("com.apple.CoreSimulator.SimRuntime.iOS-18"), Some((18, 0)));
        assert_eq!(parse_ios_version("com.apple.CoreSimulator.SimRuntime.watchOS-11-1"), None);
        assert_eq!(parse_ios_version("garbage"), None);
    }

    #[test]
    fn sequence_numbers_continue_from_the_max() {
        let names = ["iPhone 16 Pro (1)", "iPhone 16 Pro (3)", "iPhone 15 (2)"];
        assert_eq!(next_sequence_number(&names, "iPhone 16 Pro"), 4);
        assert_eq!(next_sequence_number(&names, "iPhone 15"), 3);
        assert_eq!(next_sequence_number(&names, "iPhone 14"), 1);
        assert_eq!(next_sequence_number(&[], "iPhone 16 Pro"), 1);
    }

    #[test]
    fn unnumbered_names_do_not_count() {
        assert_eq!(next_sequence_number(&["iPhone 16 Pro"], "iPhone 16 Pro"), 1);
    }

    #[test]
    fn flattens_simctl_device_listing() {
        let json = r#"{
            "devices": {
                "com.apple.CoreSimulator.SimRuntime.iOS-18-2": [
                    {
                        "udid": "AAAA-1111",
                        "name": "iPhone 16 Pro (1)",
                        "state": "Shutdown",
                        "isAvailable": true,
                        "deviceTypeIdentifier": "com.apple.CoreSimulator.SimDeviceType.iPhone-16-Pro"
                    }
                ],
                "com.apple.CoreSimulator.SimRuntime.iOS-17-0": []
            }
        }"#;
        let payload: DevicesPayload = serde_json::from_str(json).unwrap();
        let devices = flatten_devices(payload);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].udid, "AAAA-1111");
        assert_eq!(
            devices[0].runtime_id,
            "com.apple.CoreSimulator.SimRuntime.iOS-18-2"
        );
        assert!(devices[0].is_available);
    }

    fn device_type(identifier: &str, family: Option<&str>) -> DeviceType {
        DeviceType {
            name: identifier.rsplit('.').next().unwrap().replace('-', " "),
            identifier: identifier.into(),
            product_family: family.map(Into::into),
        }
    }

    fn runtime(identifier: &str, available: bool, supported: &[&str]) -> Runtime {
        Runtime {
            name: identifier.rsplit('.').next().unwrap().replace('-', " "),
            identifier: identifier.into(),
            is_available: available,
            supported_device_types: supported
                .iter()
                .map(|s| SupportedDeviceType { identifier: (*s).into() })
                .collect(),
        }
    }

    #[test]
    fn auto_create_picks_newest_runtime_and_largest_iphone() {
        let phone15 = "com.apple.CoreSimulator.SimDeviceType.iPhone-15";
        let phone16 = "com.apple.CoreSimulator.SimDeviceType.iPhone-16-Pro";
        let pad = "com.apple.CoreSimulator.SimDeviceType.iPad-Pro";
        let types = vec![
            device_type(phone15, Some("iPhone")),
            device_type(phone16, Some("iPhone")),
            device_type(pad, Some("iPad")),
        ];
        let runtimes = vec![
            runtime("com.apple.CoreSimulator.SimRuntime.iOS-17-5", true, &[]),
            runtime(
                "com.apple.CoreSimulator.SimRuntime.iOS-18-2",
                true,
                &[phone15, phone16, pad],
            ),
            runtime("com.apple.CoreSimulator.SimRuntime.iOS-26-0", false, &[]),
        ];

        let (type_id, runtime_id) = choose_auto_create(&types, &runtimes).unwrap();
        assert_eq!(type_id, phone16);
        assert_eq!(runtime_id, "com.apple.CoreSimulator.SimRuntime.iOS-18-2");
    }

    #[test]
    fn auto_create_respects_the_supported_list() {
        let phone15 = "com.apple.CoreSimulator.SimDeviceType.iPhone-15";
        let phone16 = "com.apple.CoreSimulator.SimDeviceType.iPhone-16-Pro";
        let types = vec![
            device_type(phone15, Some("iPhone")),
            device_type(phone16, Some("iPhone")),
        ];
        let runtimes = vec![runtime(
            "com.apple.CoreSimulator.SimRuntime.iOS-18-2",
            true,
            &[phone15],
        )];

        let (type_id, _) = choose_auto_create(&types, &runtimes).unwrap();
        assert_eq!(type_id, phone15);
    }

    #[test]
    fn auto_create_fails_without_runtimes() {
        assert!(choose_auto_create(&[], &[]).is_err());
    }
}
