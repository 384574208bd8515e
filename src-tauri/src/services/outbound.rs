/// Outbound encoding
/// One command, one line: compact JSON followed by a single `\n`.
use crate::error::OutboundError;
use crate::models::OutboundCommand;

pub fn encode_line(command: &OutboundCommand) -> Result<Vec<u8>, OutboundError> {
    let mut line = serde_json::to_vec(command)?;
    // Compact JSON escapes control characters inside strings; guard anyway,
    // a stray newline would split the command in two on the worker side.
    if line.contains(&b'\n') {
        return Err(OutboundError::EmbeddedNewline);
    }
    line.push(b'\n');
    Ok(line)
}
