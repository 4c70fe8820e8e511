use std::path::Path;

use serde_json::{json, Value};

use crate::error::{Error, Result};

pub const IGNITION_VERSION: &str = "3.3.0";

/// File mode 0644.
const FILE_MODE: u32 = 0o644;

/// First-boot settings for a Fedora CoreOS guest, with the SSH key already
/// read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnitionSpec {
    pub hostname: String,
    pub user: String,
    pub ssh_authorized_key: String,
    pub timezone: String,
    pub locale: String,
    pub password_hash: Option<String>,
}

impl IgnitionSpec {
    /// Reject empty values; Ignition would accept them and produce a guest
    /// nobody can log into.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("hostname", &self.hostname),
            ("user", &self.user),
            ("timezone", &self.timezone),
            ("locale", &self.locale),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation(format!("ignition {field} must not be empty")));
            }
        }
        if self.hostname.chars().any(|c| c.is_whitespace() || c == ',') {
            return Err(Error::validation(format!(
                "ignition hostname '{}' contains invalid characters",
                self.hostname
            )));
        }
        if self.ssh_authorized_key.trim().is_empty() {
            return Err(Error::validation("ssh key file is empty"));
        }
        Ok(())
    }

    /// Render the Ignition config document.
    pub fn to_json(&self) -> Value {
        let hostname = &self.hostname;
        let hosts = format!(
            "127.0.0.1   localhost localhost.localdomain localhost4 localhost4.localdomain4\n\
             ::1         localhost localhost.localdomain localhost6 localhost6.localdomain6\n\
             127.0.1.1   {hostname} {hostname}.localdomain\n"
        );
        let locale = format!("LANG={}\n", self.locale);

        let mut user = json!({
            "name": self.user,
            "sshAuthorizedKeys": [self.ssh_authorized_key.trim()],
        });
        if let Some(hash) = &self.password_hash {
            user["passwordHash"] = Value::String(hash.clone());
        }

        json!({
            "ignition": { "version": IGNITION_VERSION },
            "passwd": { "users": [user] },
            "storage": {
                "files": [
                    data_file("/etc/hostname", &format!("{hostname}\n")),
                    data_file("/etc/hosts", &hosts),
                    data_file("/etc/locale.conf", &locale),
                ]
            },
            "systemd": {
                "units": [{
                    "name": "timezone.service",
                    "enabled": true,
                    "contents": timezone_unit(&self.timezone),
                }]
            }
        })
    }
}

fn data_file(path: &str, contents: &str) -> Value {
    json!({
        "path": path,
        "mode": FILE_MODE,
        "overwrite": true,
        "contents": { "source": data_url(contents) },
    })
}

/// RFC 2397 data URL with percent-encoding of everything outside the
/// unreserved set.
fn data_url(contents: &str) -> String {
    let mut url = String::from("data:,");
    for byte in contents.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                url.push(byte as char)
            }
            _ => url.push_str(&format!("%{byte:02X}")),
        }
    }
    url
}

fn timezone_unit(timezone: &str) -> String {
    format!(
        "[Unit]\n\
         Description=Set timezone\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         ExecStart=/usr/bin/timedatectl set-timezone {timezone}\n\
         RemainAfterExit=yes\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

/// Read an SSH public key. A missing or unreadable file is a validation
/// failure since it comes straight from request parameters or config.
pub async fn load_ssh_key(path: &Path) -> Result<String> {
    let key = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::validation(format!("SSH key not found at {}: {e}", path.display()))
    })?;
    Ok(key.trim().to_string())
}
