//! Guardian command protocol.
//!
//! Operator mnemonics (`gv`, `swifi home secret`, ...) are mapped onto
//! the JSON control packets understood by the device.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Size of the listener's receive buffer; longer datagrams are truncated
pub const MAX_PACKET_SIZE: usize = 1024;

/// Packet type field sent with every command
pub const COMMAND_TYPE: u8 = 0;

/// Transport modes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Udp,
    /// Declared only, `open` rejects it
    Tcp,
    /// Declared only, `open` rejects it
    Serial,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Udp => "UDP",
            Mode::Tcp => "TCP",
            Mode::Serial => "Serial",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "udp" => Ok(Mode::Udp),
            "tcp" => Ok(Mode::Tcp),
            "serial" => Ok(Mode::Serial),
            other => Err(format!("unknown mode '{}' (expected udp, tcp or serial)", other)),
        }
    }
}

/// Control packets, serialized with the `command` tag first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command")]
pub enum Command<'a> {
    #[serde(rename = "get_valve")]
    GetValve {
        #[serde(rename = "type")]
        kind: u8,
        silent: u8,
    },
    #[serde(rename = "get_sensors")]
    GetSensors {
        #[serde(rename = "type")]
        kind: u8,
        silent: u8,
    },
    #[serde(rename = "open_valve")]
    OpenValve {
        #[serde(rename = "type")]
        kind: u8,
    },
    #[serde(rename = "close_valve")]
    CloseValve {
        #[serde(rename = "type")]
        kind: u8,
    },
    #[serde(rename = "clear_calibration")]
    ClearCalibration {
        #[serde(rename = "type")]
        kind: u8,
    },
    #[serde(rename = "update_firmware")]
    UpdateFirmware {
        target: &'a str,
        ip: &'a str,
        port: &'a str,
        path: &'a str,
        #[serde(rename = "type")]
        kind: u8,
    },
    #[serde(rename = "set_AP")]
    SetAccessPoint {
        enable: &'a str,
        #[serde(rename = "type")]
        kind: u8,
    },
    #[serde(rename = "set_WIFI_station")]
    SetWifiStation {
        #[serde(rename = "SSID")]
        ssid: &'a str,
        #[serde(rename = "PASS")]
        password: &'a str,
        #[serde(rename = "type")]
        kind: u8,
        connect: u8,
    },
}

impl Command<'_> {
    /// Serialize to the wire format
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Builds a command from parameters whose count has been checked
type Builder = for<'a> fn(&[&'a str]) -> Command<'a>;

/// Entry of the mnemonic table
pub struct CommandSpec {
    pub mnemonic: &'static str,
    /// Parameter names, in order
    pub params: &'static [&'static str],
    pub description: &'static str,
    build: Builder,
}

impl CommandSpec {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Expected syntax, e.g. `swifi <ssid> <password>`
    pub fn usage(&self) -> String {
        let mut usage = self.mnemonic.to_string();
        for param in self.params {
            usage.push_str(&format!(" <{}>", param));
        }
        usage
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("mnemonic", &self.mnemonic)
            .field("params", &self.params)
            .finish()
    }
}

fn get_valve<'a>(_: &[&'a str]) -> Command<'a> {
    Command::GetValve {
        kind: COMMAND_TYPE,
        silent: 0,
    }
}

fn get_sensors<'a>(_: &[&'a str]) -> Command<'a> {
    Command::GetSensors {
        kind: COMMAND_TYPE,
        silent: 0,
    }
}

fn open_valve<'a>(_: &[&'a str]) -> Command<'a> {
    Command::OpenValve { kind: COMMAND_TYPE }
}

fn close_valve<'a>(_: &[&'a str]) -> Command<'a> {
    Command::CloseValve { kind: COMMAND_TYPE }
}

fn clear_calibration<'a>(_: &[&'a str]) -> Command<'a> {
    Command::ClearCalibration { kind: COMMAND_TYPE }
}

fn update_esp<'a>(p: &[&'a str]) -> Command<'a> {
    Command::UpdateFirmware {
        target: "esp",
        ip: p[0],
        port: p[1],
        path: p[2],
        kind: COMMAND_TYPE,
    }
}

fn update_lora<'a>(p: &[&'a str]) -> Command<'a> {
    Command::UpdateFirmware {
        target: "lora",
        ip: p[0],
        port: p[1],
        path: p[2],
        kind: COMMAND_TYPE,
    }
}

fn set_access_point<'a>(p: &[&'a str]) -> Command<'a> {
    Command::SetAccessPoint {
        enable: p[0],
        kind: COMMAND_TYPE,
    }
}

fn set_wifi_station<'a>(p: &[&'a str]) -> Command<'a> {
    Command::SetWifiStation {
        ssid: p[0],
        password: p[1],
        kind: COMMAND_TYPE,
        connect: 1,
    }
}

/// All known mnemonics
pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        mnemonic: "gv",
        params: &[],
        description: "Get current valve state",
        build: get_valve,
    },
    CommandSpec {
        mnemonic: "gs",
        params: &[],
        description: "Get sensor list",
        build: get_sensors,
    },
    CommandSpec {
        mnemonic: "open",
        params: &[],
        description: "Open valve (motor)",
        build: open_valve,
    },
    CommandSpec {
        mnemonic: "close",
        params: &[],
        description: "Close valve (motor)",
        build: close_valve,
    },
    CommandSpec {
        mnemonic: "cc",
        params: &[],
        description: "Clear motor calibration",
        build: clear_calibration,
    },
    CommandSpec {
        mnemonic: "uesp",
        params: &["ip", "port", "path"],
        description: "Update ESP firmware from ip:port/path",
        build: update_esp,
    },
    CommandSpec {
        mnemonic: "ulora",
        params: &["ip", "port", "path"],
        description: "Update LoRa firmware from ip:port/path",
        build: update_lora,
    },
    CommandSpec {
        mnemonic: "sap",
        params: &["flag"],
        description: "Enable (1) or disable (0) access point mode",
        build: set_access_point,
    },
    CommandSpec {
        mnemonic: "swifi",
        params: &["ssid", "password"],
        description: "Set station mode WiFi credentials",
        build: set_wifi_station,
    },
];

/// Find a mnemonic in the command table
pub fn lookup(mnemonic: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|spec| spec.mnemonic == mnemonic)
}

/// Encode a mnemonic and its parameters into a JSON packet.
///
/// Unknown mnemonics are reported before the parameter count is checked.
/// Parameters are emitted as JSON strings, so quotes and backslashes are
/// escaped rather than spliced into the document.
pub fn encode<S: AsRef<str>>(mnemonic: &str, params: &[S]) -> Result<String> {
    let spec = lookup(mnemonic).ok_or_else(|| Error::UnknownCommand(mnemonic.to_string()))?;

    if params.len() != spec.arity() {
        return Err(Error::InvalidPacket(format!(
            "'{}' takes {} parameter(s), got {} (usage: {})",
            spec.mnemonic,
            spec.arity(),
            params.len(),
            spec.usage()
        )));
    }

    let params: Vec<&str> = params.iter().map(|p| p.as_ref()).collect();
    (spec.build)(&params).to_json()
}

/// Encode a whitespace separated command line, e.g. `swifi home secret`
pub fn parse_line(line: &str) -> Result<String> {
    let mut tokens = line.split_whitespace();
    let mnemonic = tokens
        .next()
        .ok_or_else(|| Error::InvalidPacket("empty command".to_string()))?;
    let params: Vec<&str> = tokens.collect();
    encode(mnemonic, &params)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_PARAMS: [&str; 0] = [];

    #[test]
    fn test_exact_payloads() {
        assert_eq!(
            encode("gv", &NO_PARAMS).unwrap(),
            r#"{"command":"get_valve","type":0,"silent":0}"#
        );
        assert_eq!(
            encode("swifi", &["home", "secret"]).unwrap(),
            r#"{"command":"set_WIFI_station","SSID":"home","PASS":"secret","type":0,"connect":1}"#
        );
        assert_eq!(
            encode("uesp", &["10.0.0.2", "8000", "/fw.bin"]).unwrap(),
            r#"{"command":"update_firmware","target":"esp","ip":"10.0.0.2","port":"8000","path":"/fw.bin","type":0}"#
        );
        assert_eq!(
            encode("sap", &["1"]).unwrap(),
            r#"{"command":"set_AP","enable":"1","type":0}"#
        );
    }

    #[test]
    fn test_params_substituted_in_order() {
        for spec in COMMANDS {
            let params: Vec<String> = (0..spec.arity()).map(|i| format!("value{}", i)).collect();
            let json = encode(spec.mnemonic, &params).unwrap();

            let value: serde_json::Value = serde_json::from_str(&json).unwrap();
            assert!(value.get("command").and_then(|v| v.as_str()).is_some());
            assert_eq!(value.get("type").and_then(|v| v.as_u64()), Some(0));

            let mut last = 0;
            for param in &params {
                let pos = json.find(param.as_str()).unwrap();
                assert!(pos > last, "{} out of order in {}", param, json);
                last = pos;
            }
        }
    }

    #[test]
    fn test_arity_mismatch() {
        for spec in COMMANDS {
            let too_many: Vec<String> = (0..spec.arity() + 1).map(|i| i.to_string()).collect();
            match encode(spec.mnemonic, &too_many) {
                Err(Error::InvalidPacket(msg)) => assert!(msg.contains(&spec.usage())),
                other => panic!("{}: expected InvalidPacket, got {:?}", spec.mnemonic, other),
            }

            if spec.arity() > 0 {
                let too_few: Vec<String> = (0..spec.arity() - 1).map(|i| i.to_string()).collect();
                assert!(matches!(
                    encode(spec.mnemonic, &too_few),
                    Err(Error::InvalidPacket(_))
                ));
            }
        }
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            encode("unknown_cmd", &NO_PARAMS),
            Err(Error::UnknownCommand(name)) if name == "unknown_cmd"
        ));
        // Unknown wins over a wrong parameter count
        assert!(matches!(encode("zz", &["a", "b"]), Err(Error::UnknownCommand(_))));
        // Mnemonics are case sensitive
        assert!(matches!(encode("GV", &NO_PARAMS), Err(Error::UnknownCommand(_))));
    }

    #[test]
    fn test_parameters_escaped() {
        let json = encode("swifi", &[r#"my"net"#, r"pa\ss"]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["SSID"], r#"my"net"#);
        assert_eq!(value["PASS"], r"pa\ss");
        assert_eq!(value.as_object().unwrap().len(), 5);
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("  gv ").unwrap(), encode("gv", &NO_PARAMS).unwrap());
        assert_eq!(
            parse_line("swifi home secret").unwrap(),
            encode("swifi", &["home", "secret"]).unwrap()
        );
        assert!(matches!(parse_line("   "), Err(Error::InvalidPacket(_))));
        assert!(matches!(parse_line("sap"), Err(Error::InvalidPacket(_))));
        assert!(matches!(parse_line("reboot now"), Err(Error::UnknownCommand(_))));
    }

    #[test]
    fn test_usage() {
        assert_eq!(lookup("swifi").unwrap().usage(), "swifi <ssid> <password>");
        assert_eq!(lookup("gv").unwrap().usage(), "gv");
        assert!(lookup("nope").is_none());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("udp".parse::<Mode>().unwrap(), Mode::Udp);
        assert_eq!("TCP".parse::<Mode>().unwrap(), Mode::Tcp);
        assert_eq!(" serial ".parse::<Mode>().unwrap(), Mode::Serial);
        assert!("bluetooth".parse::<Mode>().is_err());
        assert_eq!(Mode::Udp.to_string(), "UDP");
    }
}
