use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use fcgiwire_record::NameValuePair;
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ValueOutput {
    name: String,
    value: String,
}

#[derive(Serialize)]
struct ValuesOutput<'a> {
    addr: &'a str,
    values: Vec<ValueOutput>,
}

/// Print a GetValuesResult.
pub fn print_values(addr: &str, pairs: &[NameValuePair], format: OutputFormat) {
    let values: Vec<ValueOutput> = pairs
        .iter()
        .map(|pair| ValueOutput {
            name: lossy(&pair.name),
            value: lossy(&pair.value),
        })
        .collect();

    match format {
        OutputFormat::Json => {
            let out = ValuesOutput { addr, values };
            println!("{}", to_json(&out));
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["NAME", "VALUE"]);
            for value in &values {
                table.add_row(vec![value.name.clone(), value.value.clone()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("Management values ({addr}):");
            for value in &values {
                println!("  {:<18}{}", value.name, value.value);
            }
        }
        OutputFormat::Raw => {
            for value in &values {
                println!("{}={}", value.name, value.value);
            }
        }
    }
}

#[derive(Serialize)]
pub struct ResponseOutput {
    pub request_id: u16,
    pub app_status: u32,
    pub protocol_status: String,
    pub stdout: String,
    pub stderr: String,
}

/// Print the outcome of a request.
///
/// Raw, table and pretty pass the response bytes through unchanged.
pub fn print_response(out: &ResponseOutput, stdout: &[u8], stderr: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", to_json(out)),
        _ => {
            print_raw(stdout);
            let mut err = std::io::stderr();
            let _ = err.write_all(stderr);
            let _ = err.flush();
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

pub fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lossy_keeps_text_and_replaces_invalid_bytes() {
        assert_eq!(lossy(b"FCGI_MAX_CONNS"), "FCGI_MAX_CONNS");
        assert_eq!(lossy(&[b'a', 0xff]), "a\u{fffd}");
    }

    #[test]
    fn response_serializes_flat() {
        let out = ResponseOutput {
            request_id: 1,
            app_status: 3,
            protocol_status: "request_complete".to_string(),
            stdout: "hi".to_string(),
            stderr: String::new(),
        };
        let json: serde_json::Value = serde_json::from_str(&to_json(&out)).expect("valid json");
        assert_eq!(json["app_status"], 3);
        assert_eq!(json["protocol_status"], "request_complete");
    }
}
