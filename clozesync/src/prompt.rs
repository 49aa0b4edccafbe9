use std::io::{self, BufRead, Write};

use crate::sync::orphan::OrphanCandidate;

/// How deletion candidates are confirmed after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPolicy {
    Ask,
    ConfirmAll,
    KeepAll,
}

/// Returns the candidates confirmed for deletion. With [`DeletionPolicy::Ask`]
/// each candidate is answered on `input`; anything but `y`/`yes` keeps it,
/// and end of input keeps the rest.
pub fn choose_deletions<R, W>(
    candidates: &[OrphanCandidate],
    policy: DeletionPolicy,
    input: &mut R,
    output: &mut W,
) -> io::Result<Vec<OrphanCandidate>>
where
    R: BufRead,
    W: Write,
{
    match policy {
        DeletionPolicy::ConfirmAll => return Ok(candidates.to_vec()),
        DeletionPolicy::KeepAll => return Ok(Vec::new()),
        DeletionPolicy::Ask => {}
    }
    let mut confirmed = Vec::new();
    let mut line = String::new();
    for candidate in candidates {
        write!(
            output,
            "Delete note {} ({} card {})? [y/N] ",
            candidate.note_id,
            candidate.path,
            candidate.position + 1
        )?;
        output.flush()?;
        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            break;
        }
        if matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
            confirmed.push(candidate.clone());
        }
    }
    Ok(confirmed)
}
