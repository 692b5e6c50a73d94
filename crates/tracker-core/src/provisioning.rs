//! Serial console provisioning: `SET WIFI "<ssid>" "<password>"`.

use heapless::Vec;
use log::{debug, info, warn};

use crate::network::WifiCredentials;

pub const MAX_COMMAND_LINE_BYTES: usize = 128;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommandError {
    NotACommand,
    MissingSsid,
    UnterminatedQuote,
    TooLong,
}

/// Parses one console line. Arguments are either double-quoted or bare
/// words; the password may be omitted for open networks.
pub fn parse_set_wifi(line: &str) -> Result<WifiCredentials, CommandError> {
    let mut rest = line.trim();

    let is_set_wifi = matches!(next_argument(&mut rest), Ok(Some(word)) if word.eq_ignore_ascii_case("SET"))
        && matches!(next_argument(&mut rest), Ok(Some(word)) if word.eq_ignore_ascii_case("WIFI"));
    if !is_set_wifi {
        return Err(CommandError::NotACommand);
    }

    let ssid = match next_argument(&mut rest)? {
        Some(ssid) if !ssid.is_empty() => ssid,
        _ => return Err(CommandError::MissingSsid),
    };
    let password = next_argument(&mut rest)?.unwrap_or("");

    WifiCredentials::new(ssid, password).ok_or(CommandError::TooLong)
}

fn next_argument<'a>(rest: &mut &'a str) -> Result<Option<&'a str>, CommandError> {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        *rest = trimmed;
        return Ok(None);
    }

    if let Some(quoted) = trimmed.strip_prefix('"') {
        let end = quoted.find('"').ok_or(CommandError::UnterminatedQuote)?;
        *rest = &quoted[end + 1..];
        return Ok(Some(&quoted[..end]));
    }

    let end = trimmed
        .find(char::is_whitespace)
        .unwrap_or(trimmed.len());
    *rest = &trimmed[end..];
    Ok(Some(&trimmed[..end]))
}

/// Accumulates console bytes and yields credentials on each complete
/// `SET WIFI` line.
#[derive(Debug, Default)]
pub struct CommandLineBuffer {
    line: Vec<u8, MAX_COMMAND_LINE_BYTES>,
    overflowed: bool,
}

impl CommandLineBuffer {
    pub const fn new() -> Self {
        Self {
            line: Vec::new(),
            overflowed: false,
        }
    }

    pub fn push_byte(&mut self, byte: u8) -> Option<WifiCredentials> {
        if byte != b'\r' && byte != b'\n' {
            if self.line.push(byte).is_err() {
                self.overflowed = true;
            }
            return None;
        }

        let overflowed = core::mem::replace(&mut self.overflowed, false);
        if self.line.is_empty() {
            return None;
        }
        if overflowed {
            warn!("serial: discarding over-long command line");
            self.line.clear();
            return None;
        }

        let parsed = match core::str::from_utf8(&self.line) {
            Ok(text) => parse_set_wifi(text),
            Err(_) => Err(CommandError::NotACommand),
        };
        self.line.clear();

        match parsed {
            Ok(credentials) => {
                info!(
                    "serial: received credentials for SSID '{}' and pass length {}",
                    credentials.ssid,
                    credentials.password.len()
                );
                Some(credentials)
            }
            Err(CommandError::NotACommand) => {
                debug!("serial: ignoring unknown command");
                None
            }
            Err(err) => {
                warn!("serial: malformed SET WIFI command: {:?}", err);
                None
            }
        }
    }
}
