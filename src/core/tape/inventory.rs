//! Parser for the tape robot status listing
//!
//! ```text
//!   Storage Changer /dev/sg7:2 Drives, 38 Slots ( 8 Import/Export )
//! Data Transfer Element 0:Full (Storage Element 1 Loaded):VolumeTag = 000000S1
//! Data Transfer Element 1:Empty
//!       Storage Element 1:Full :VolumeTag=000001S1
//!       Storage Element 30:Full
//!       Storage Element 31 IMPORT/EXPORT:Empty
//! ```
//!
//! Lines are matched by substring, in order; element numbers in the text are
//! not used. A full element without a volume tag reads as `NoBar`. The
//! changer summary line is kept so callers can compare it with what was
//! listed.

use crate::core::tape::NO_BAR;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const CHANGER_PATTERN: &str =
    r"Storage Changer\s+(\S+):(\d+) Drives, (\d+) Slots \( (\d+) Import/Export \)";

/// Counts announced by the changer summary line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangerSummary {
    pub device: String,
    pub drives: usize,
    pub slots: usize,
    pub import_export: usize,
}

/// One storage slot as listed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLine {
    pub tape_id: Option<String>,
    pub import_export: bool,
}

/// Parsed status listing, in listing order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDump {
    pub changer: Option<ChangerSummary>,
    pub drives: Vec<Option<String>>,
    pub slots: Vec<SlotLine>,
}

impl StatusDump {
    pub fn empty_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.tape_id.is_none()).count()
    }

    /// Render in the robot's own format
    pub fn render(&self, device: &str) -> String {
        let imp_exp = self.slots.iter().filter(|s| s.import_export).count();
        let mut out = format!(
            "  Storage Changer {}:{} Drives, {} Slots ( {} Import/Export )\n",
            device,
            self.drives.len(),
            self.slots.len(),
            imp_exp
        );
        for (i, d) in self.drives.iter().enumerate() {
            match d {
                Some(tape) => out.push_str(&format!(
                    "Data Transfer Element {}:Full (Storage Element 0 Loaded):VolumeTag = {}\n",
                    i, tape
                )),
                None => out.push_str(&format!("Data Transfer Element {}:Empty\n", i)),
            }
        }
        for (i, s) in self.slots.iter().enumerate() {
            let ie = if s.import_export { " IMPORT/EXPORT" } else { "" };
            match &s.tape_id {
                Some(tape) => out.push_str(&format!(
                    "      Storage Element {}{}:Full :VolumeTag={}\n",
                    i + 1,
                    ie,
                    tape
                )),
                None => out.push_str(&format!("      Storage Element {}{}:Empty\n", i + 1, ie)),
            }
        }
        out
    }
}

/// Volume tag of a `:Full` line
///
/// The text after the first `=`, without leading blanks, up to the next blank.
fn volume_tag(line: &str) -> String {
    match line.split_once('=') {
        Some((_, rest)) => {
            let tag = rest
                .trim_start()
                .split(|c: char| c == '=' || c.is_whitespace())
                .next()
                .unwrap_or("");
            if tag.is_empty() {
                NO_BAR.to_string()
            } else {
                tag.to_string()
            }
        }
        None => NO_BAR.to_string(),
    }
}

fn changer_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(CHANGER_PATTERN).ok()).as_ref()
}

fn parse_changer(line: &str) -> Option<ChangerSummary> {
    let caps = changer_regex()?.captures(line)?;
    Some(ChangerSummary {
        device: caps[1].to_string(),
        drives: caps[2].parse().ok()?,
        slots: caps[3].parse().ok()?,
        import_export: caps[4].parse().ok()?,
    })
}

/// Parse a status listing
pub fn parse_status(text: &str) -> StatusDump {
    let mut dump = StatusDump::default();
    for line in text.lines() {
        if line.contains("Storage Changer") {
            dump.changer = parse_changer(line);
        } else if line.contains("Data Transfer Element") {
            let tape = line.contains(":Full").then(|| volume_tag(line));
            dump.drives.push(tape);
        } else if line.contains("Storage Element") {
            let tape = line.contains(":Full").then(|| volume_tag(line));
            dump.slots.push(SlotLine {
                tape_id: tape,
                import_export: line.contains("IMPORT/EXPORT"),
            });
        }
    }
    dump
}
