//! NetworkManager / ModemManager backed provider
//!
//! Shells out to `nmcli` for link control and addressing and to `mmcli` for the
//! subscriber number. Output is requested in terse (`-t`, `-g`, `-K`) form.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{InterfaceHandle, ModemProvider, UNKNOWN_NUMBER};
use crate::error::{Result, RotaError};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Modem provider driving `nmcli` and `mmcli`
pub struct NmcliModemProvider {
    command_timeout: Duration,
}

impl Default for NmcliModemProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl NmcliModemProvider {
    pub fn new() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> anyhow::Result<String> {
        debug!(program, ?args, "Running modem command");

        let output = tokio::time::timeout(
            self.command_timeout,
            Command::new(program).args(args).kill_on_drop(true).output(),
        )
        .await
        .with_context(|| format!("{} timed out", program))?
        .with_context(|| format!("failed to spawn {}", program))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_for(
        &self,
        handle: &InterfaceHandle,
        program: &str,
        args: &[&str],
    ) -> Result<String> {
        self.run(program, args)
            .await
            .map_err(|e| RotaError::hardware(handle.as_str(), format!("{:#}", e)))
    }

    async fn lookup_number(&self, handle: &InterfaceHandle) -> anyhow::Result<Option<String>> {
        let listing = self.run("mmcli", &["-K", "-L"]).await?;

        for path in parse_modem_paths(&listing) {
            let details = self.run("mmcli", &["-K", "-m", &path]).await?;
            let fields = parse_key_values(&details);

            let port = fields
                .iter()
                .find(|(key, _)| key == "modem.generic.primary-port")
                .map(|(_, value)| value.as_str());
            if port != Some(handle.as_str()) {
                continue;
            }

            return Ok(fields
                .into_iter()
                .find(|(key, _)| key == "modem.generic.own-numbers.value[1]")
                .map(|(_, value)| value)
                .filter(|value| !value.is_empty() && value != "--"));
        }

        Ok(None)
    }
}

#[async_trait]
impl ModemProvider for NmcliModemProvider {
    fn name(&self) -> &'static str {
        "nmcli"
    }

    async fn list_interfaces(&self) -> Result<BTreeSet<InterfaceHandle>> {
        let output = self
            .run("nmcli", &["-t", "-f", "DEVICE,TYPE", "device"])
            .await
            .map_err(|e| RotaError::hardware("*", format!("{:#}", e)))?;
        Ok(parse_gsm_devices(&output))
    }

    async fn connect(&self, handle: &InterfaceHandle) -> Result<()> {
        self.run_for(handle, "nmcli", &["device", "connect", handle.as_str()])
            .await
            .map(|_| ())
    }

    async fn disconnect(&self, handle: &InterfaceHandle) -> Result<()> {
        self.run_for(handle, "nmcli", &["device", "disconnect", handle.as_str()])
            .await
            .map(|_| ())
    }

    async fn subscriber_number(&self, handle: &InterfaceHandle) -> String {
        match self.lookup_number(handle).await {
            Ok(Some(number)) => number,
            Ok(None) => UNKNOWN_NUMBER.to_string(),
            Err(e) => {
                debug!(interface = %handle, error = %e, "Subscriber number lookup failed");
                UNKNOWN_NUMBER.to_string()
            }
        }
    }

    async fn local_ipv4(&self, handle: &InterfaceHandle) -> Result<Option<Ipv4Addr>> {
        let output = self
            .run_for(
                handle,
                "nmcli",
                &["-g", "IP4.ADDRESS", "device", "show", handle.as_str()],
            )
            .await?;
        Ok(parse_ipv4_address(&output))
    }
}

/// Split one terse-mode line on unescaped `:`
fn split_terse(line: &str) -> Vec<String> {
    let mut fields = vec![String::new()];
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    if let Some(field) = fields.last_mut() {
                        field.push(escaped);
                    }
                }
            }
            ':' => fields.push(String::new()),
            _ => {
                if let Some(field) = fields.last_mut() {
                    field.push(c);
                }
            }
        }
    }

    fields
}

fn parse_gsm_devices(output: &str) -> BTreeSet<InterfaceHandle> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_terse(line.trim());
            match fields.as_slice() {
                [device, kind] if kind == "gsm" && !device.is_empty() => {
                    Some(InterfaceHandle::new(device.clone()))
                }
                _ => None,
            }
        })
        .collect()
}

/// First address of `IP4.ADDRESS`, which comes as `a.b.c.d/prefix | ...`
fn parse_ipv4_address(output: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .flat_map(|line| line.split('|'))
        .filter_map(|entry| {
            let entry = entry.trim();
            let addr = entry.split('/').next().unwrap_or(entry);
            addr.parse::<Ipv4Addr>().ok()
        })
        .next()
}

/// `key : value` pairs of mmcli key-value output
fn parse_key_values(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn parse_modem_paths(listing: &str) -> Vec<String> {
    parse_key_values(listing)
        .into_iter()
        .filter(|(key, _)| key.starts_with("modem-list.value["))
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
        .collect()
}
