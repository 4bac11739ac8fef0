//! Storage layout and configuration files.
//!
//! Two configs live under the node directory: the daemon config at
//! `<dir>/config` and the transport config at `<dir>/rns/config`. Both are
//! written from embedded templates only when absent, so user edits survive
//! every restart. The transport config uses the Reticulum dialect: INI-style
//! `[section]` headers with `[[name]]` interface subsections, which no
//! general-purpose parser handles, so a small order-preserving editor lives
//! here.

use std::io;
use std::path::{Path, PathBuf};

pub const LXMF_CONFIG_FILE: &str = "config";
pub const RNS_DIR: &str = "rns";
pub const RNS_CONFIG_FILE: &str = "config";
pub const STORAGE_DIR: &str = "storage";
pub const RATCHETS_DIR: &str = "ratchets";
pub const IDENTITY_FILE: &str = "identity";

const INTERFACES_SECTION: &str = "interfaces";

/// Physical devices AutoInterface may bind by default.
const ALLOWED_DEVICE_PREFIXES: &[&str] = &["en", "eth", "wlan", "wlp", "wl", "pdp_ip"];

const LXMF_CONFIG_TEMPLATE: &str = "\
# lxnode daemon configuration. Written once; edits are preserved.

[node]
    # Announced to peers. The start options override this at runtime.
    display_name =

[propagation]
    enable_node = no
";

const RNS_CONFIG_TEMPLATE: &str = "\
# Reticulum configuration for this node. Written once; edits are preserved.

[reticulum]
    enable_transport = no
    share_instance = yes
    panic_on_interface_error = no

[logging]
    loglevel = 4

[interfaces]
    [[Default Interface]]
        type = AutoInterface
        enabled = yes

    [[RNS Testnet Amsterdam]]
        type = TCPClientInterface
        enabled = yes
        target_host = amsterdam.connect.reticulum.network
        target_port = 4965
";

/// One `[[name]]` subsection of the `[interfaces]` section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub name: String,
    pub kind: String,
    pub enabled: bool,
}

impl InterfaceConfig {
    pub fn is_tcp(&self) -> bool {
        self.kind.starts_with("TCP")
    }
}

pub fn ensure_storage_tree(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::create_dir_all(dir.join(STORAGE_DIR))?;
    std::fs::create_dir_all(dir.join(RNS_DIR))?;
    Ok(())
}

pub fn ensure_lxmf_config(dir: &Path) -> io::Result<PathBuf> {
    let path = dir.join(LXMF_CONFIG_FILE);
    if !path.exists() {
        std::fs::write(&path, LXMF_CONFIG_TEMPLATE)?;
    }
    Ok(path)
}

pub fn reset_ratchets(dir: &Path) -> io::Result<()> {
    let ratchets = dir.join(STORAGE_DIR).join(RATCHETS_DIR);
    if ratchets.exists() {
        std::fs::remove_dir_all(&ratchets)?;
    }
    Ok(())
}

pub fn reset_transport_config(dir: &Path) -> io::Result<()> {
    let config = dir.join(RNS_DIR).join(RNS_CONFIG_FILE);
    if config.exists() {
        std::fs::remove_file(&config)?;
    }
    Ok(())
}

/// Ensure a usable transport config exists and return the config directory
/// the transport should be opened with. A user-supplied directory is used
/// untouched; the managed one is created from the embedded template and has
/// missing AutoInterface defaults filled in.
pub fn ensure_transport_config(dir: &Path, external: Option<&Path>) -> io::Result<PathBuf> {
    if let Some(external) = external {
        return Ok(external.to_path_buf());
    }
    let rns_dir = dir.join(RNS_DIR);
    std::fs::create_dir_all(&rns_dir)?;
    let path = rns_dir.join(RNS_CONFIG_FILE);
    if !path.exists() {
        std::fs::write(&path, RNS_CONFIG_TEMPLATE)?;
    }
    let mut config = RnsConfig::load(&path)?;
    if config.fill_auto_interface_defaults(&local_device_allowlist()) {
        config.save(&path)?;
    }
    Ok(rns_dir)
}

/// Names of local network devices AutoInterface should consider, derived
/// from the allowlisted name prefixes. Virtual tunnels (`utun*`) and the
/// Apple wireless direct link (`awdl0`) are stripped.
pub fn local_device_allowlist() -> Vec<String> {
    let mut devices = Vec::new();
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return devices;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "awdl0" || name.starts_with("utun") {
            continue;
        }
        if ALLOWED_DEVICE_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
            devices.push(name);
        }
    }
    devices.sort();
    devices
}

/// Line-preserving view of a Reticulum-dialect config file.
#[derive(Clone, Debug, Default)]
pub struct RnsConfig {
    lines: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum LineKind<'a> {
    Section(&'a str),
    Subsection(&'a str),
    Entry(&'a str, &'a str),
    Other,
}

fn classify(line: &str) -> LineKind<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return LineKind::Other;
    }
    if let Some(name) = trimmed.strip_prefix("[[").and_then(|rest| rest.strip_suffix("]]")) {
        return LineKind::Subsection(name.trim());
    }
    if let Some(name) = trimmed.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        return LineKind::Section(name.trim());
    }
    if let Some((key, value)) = trimmed.split_once('=') {
        return LineKind::Entry(key.trim(), value.trim());
    }
    LineKind::Other
}

fn truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "yes" | "true" | "on" | "1")
}

impl RnsConfig {
    pub fn parse(text: &str) -> Self {
        Self { lines: text.lines().map(|line| line.to_string()).collect() }
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut text = self.lines.join("\n");
        text.push('\n');
        std::fs::write(path, text)
    }

    pub fn interfaces(&self) -> Vec<InterfaceConfig> {
        let mut interfaces = Vec::new();
        let mut in_interfaces = false;
        let mut current: Option<InterfaceConfig> = None;
        let mut explicit_enabled: Option<bool> = None;
        let flush =
            |current: &mut Option<InterfaceConfig>,
             explicit: &mut Option<bool>,
             out: &mut Vec<InterfaceConfig>| {
                if let Some(mut iface) = current.take() {
                    if let Some(enabled) = explicit.take() {
                        iface.enabled = enabled;
                    }
                    out.push(iface);
                }
                *explicit = None;
            };
        for line in &self.lines {
            match classify(line) {
                LineKind::Section(name) => {
                    flush(&mut current, &mut explicit_enabled, &mut interfaces);
                    in_interfaces = name.eq_ignore_ascii_case(INTERFACES_SECTION);
                }
                LineKind::Subsection(name) if in_interfaces => {
                    flush(&mut current, &mut explicit_enabled, &mut interfaces);
                    current = Some(InterfaceConfig {
                        name: name.to_string(),
                        kind: String::new(),
                        enabled: false,
                    });
                }
                LineKind::Entry(key, value) => {
                    if let Some(iface) = current.as_mut() {
                        match key {
                            "type" => iface.kind = value.to_string(),
                            // interface_enabled wins over enabled when both exist
                            "interface_enabled" => explicit_enabled = Some(truthy(value)),
                            "enabled" if explicit_enabled.is_none() => {
                                iface.enabled = truthy(value);
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        flush(&mut current, &mut explicit_enabled, &mut interfaces);
        interfaces
    }

    /// Half-open line range of the body of `[[subsection]]` inside `[section]`.
    fn subsection_bounds(&self, section: &str, subsection: &str) -> Option<(usize, usize)> {
        let mut in_section = false;
        let mut start = None;
        for (index, line) in self.lines.iter().enumerate() {
            match classify(line) {
                LineKind::Section(name) => {
                    if let Some(start) = start {
                        return Some((start, index));
                    }
                    in_section = name.eq_ignore_ascii_case(section);
                }
                LineKind::Subsection(name) => {
                    if let Some(start) = start {
                        return Some((start, index));
                    }
                    if in_section && name == subsection {
                        start = Some(index + 1);
                    }
                }
                _ => {}
            }
        }
        start.map(|start| (start, self.lines.len()))
    }

    pub fn subsection_value(&self, section: &str, subsection: &str, key: &str) -> Option<String> {
        let (start, end) = self.subsection_bounds(section, subsection)?;
        self.lines[start..end].iter().find_map(|line| match classify(line) {
            LineKind::Entry(entry_key, value) if entry_key == key => Some(value.to_string()),
            _ => None,
        })
    }

    /// Set `key = value` inside a subsection, replacing an existing entry or
    /// inserting a new one. Returns false when the subsection does not exist.
    pub fn set_subsection_value(
        &mut self,
        section: &str,
        subsection: &str,
        key: &str,
        value: &str,
        only_if_missing: bool,
    ) -> bool {
        let Some((start, end)) = self.subsection_bounds(section, subsection) else {
            return false;
        };
        for index in start..end {
            if let LineKind::Entry(entry_key, _) = classify(&self.lines[index]) {
                if entry_key == key {
                    if !only_if_missing {
                        let line =
                            format!("{}{key} = {value}", leading_whitespace(&self.lines[index]));
                        self.lines[index] = line;
                    }
                    return true;
                }
            }
        }
        // insert before trailing blank lines so the subsection stays compact
        let mut insert_at = end;
        while insert_at > start && self.lines[insert_at - 1].trim().is_empty() {
            insert_at -= 1;
        }
        let indent = self.lines[start..end]
            .iter()
            .find(|line| matches!(classify(line), LineKind::Entry(..)))
            .map(|line| leading_whitespace(line).to_string())
            .unwrap_or_else(|| "        ".to_string());
        self.lines.insert(insert_at, format!("{indent}{key} = {value}"));
        true
    }

    pub fn set_interface_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let value = if enabled { "Yes" } else { "No" };
        self.set_subsection_value(INTERFACES_SECTION, name, "interface_enabled", value, false)
    }

    /// Add missing AutoInterface keys: the device allowlist and
    /// `ingress_control = no`. Returns true when anything changed.
    pub fn fill_auto_interface_defaults(&mut self, devices: &[String]) -> bool {
        let auto_sections: Vec<String> = self
            .interfaces()
            .into_iter()
            .filter(|iface| iface.kind == "AutoInterface")
            .map(|iface| iface.name)
            .collect();
        let mut changed = false;
        for name in auto_sections {
            if !devices.is_empty()
                && self.subsection_value(INTERFACES_SECTION, &name, "devices").is_none()
            {
                changed |= self.set_subsection_value(
                    INTERFACES_SECTION,
                    &name,
                    "devices",
                    &devices.join(","),
                    true,
                );
            }
            if self.subsection_value(INTERFACES_SECTION, &name, "ingress_control").is_none() {
                changed |= self.set_subsection_value(
                    INTERFACES_SECTION,
                    &name,
                    "ingress_control",
                    "no",
                    true,
                );
            }
        }
        changed
    }
}

fn leading_whitespace(line: &str) -> &str {
    let end = line.len() - line.trim_start().len();
    &line[..end]
}
