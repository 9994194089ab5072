// SPDX-License-Identifier: Apache-2.0
//
// Storage-medium classification — rotational vs solid-state, used only
// to annotate residual-recovery risk in deletion reports.
//
// Everything here is advisory. Classification failures degrade to
// `MediumType::Unknown` with a note; no security decision ever depends
// on the answer.

use std::path::Path;

use cinder_core::MediumType;
#[cfg(target_os = "linux")]
use tracing::debug;

/// Classify the storage medium backing `path`.
///
/// Returns the classification and any caveats worth surfacing in a
/// deletion report.
pub fn classify(path: &Path) -> (MediumType, Vec<String>) {
    let mut notes = Vec::new();
    let medium = detect(path, &mut notes);

    match medium {
        MediumType::SolidState => notes.push(
            "solid-state medium: secure delete effective but not disk-block-guaranteed \
             (wear leveling may retain stale copies)"
                .to_owned(),
        ),
        MediumType::Unknown => {
            notes.push("storage medium could not be classified; treating as unknown".to_owned())
        }
        MediumType::Rotational => {}
    }

    (medium, notes)
}

#[cfg(target_os = "linux")]
fn detect(path: &Path, notes: &mut Vec<String>) -> MediumType {
    // Walk /sys/block and take the first device whose rotational flag we
    // can read. Mapping a path to its exact block device would need
    // mount-table parsing; for an advisory annotation the primary disk
    // is close enough.
    let _ = path;
    let entries = match std::fs::read_dir("/sys/block") {
        Ok(e) => e,
        Err(e) => {
            notes.push(format!("could not read /sys/block: {e}"));
            return MediumType::Unknown;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        // Skip virtual devices (loop, ram, zram, device-mapper).
        if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
            continue;
        }
        let rotational = entry.path().join("queue/rotational");
        if let Ok(flag) = std::fs::read_to_string(&rotational) {
            debug!(device = %name, flag = flag.trim(), "rotational flag read");
            return match flag.trim() {
                "1" => MediumType::Rotational,
                "0" => MediumType::SolidState,
                _ => MediumType::Unknown,
            };
        }
    }

    notes.push("no physical block device with a rotational flag found".to_owned());
    MediumType::Unknown
}

#[cfg(target_os = "macos")]
fn detect(path: &Path, notes: &mut Vec<String>) -> MediumType {
    use std::process::Command;

    let output = Command::new("diskutil")
        .arg("info")
        .arg(path)
        .output();

    match output {
        Ok(out) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout);
            for line in text.lines() {
                if line.contains("Solid State") {
                    return if line.contains("Yes") {
                        MediumType::SolidState
                    } else {
                        MediumType::Rotational
                    };
                }
            }
            notes.push("diskutil output had no Solid State field".to_owned());
            MediumType::Unknown
        }
        Ok(out) => {
            notes.push(format!("diskutil info exited with {}", out.status));
            MediumType::Unknown
        }
        Err(e) => {
            notes.push(format!("could not run diskutil: {e}"));
            MediumType::Unknown
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn detect(_path: &Path, notes: &mut Vec<String>) -> MediumType {
    notes.push("medium classification not implemented on this platform".to_owned());
    MediumType::Unknown
}
