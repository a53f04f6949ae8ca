//! PackBits run-length coding, as used for PSD channel rows

use crate::{Error, Result};

/// Encode one row.
pub fn encode(row: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(row.len() + row.len() / 128 + 1);
    let mut i = 0;
    while i < row.len() {
        let run = run_length(&row[i..]);
        if run >= 3 {
            out.push((257 - run) as u8);
            out.push(row[i]);
            i += run;
            continue;
        }

        let start = i;
        while i < row.len() && i - start < 128 && run_length(&row[i..]) < 3 {
            i += 1;
        }
        out.push((i - start - 1) as u8);
        out.extend_from_slice(&row[start..i]);
    }
    out
}

/// Decode exactly `expected` bytes from `input`.
pub fn decode(input: &[u8], expected: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected);
    let mut i = 0;
    while out.len() < expected {
        let header = *input
            .get(i)
            .ok_or_else(|| Error::DecodeError("packbits stream ended early".into()))? as i8;
        i += 1;
        match header {
            -128 => {}
            0..=127 => {
                let n = header as usize + 1;
                let literal = input
                    .get(i..i + n)
                    .ok_or_else(|| Error::DecodeError("packbits literal overruns input".into()))?;
                out.extend_from_slice(literal);
                i += n;
            }
            _ => {
                let n = 1 - header as isize;
                let value = *input
                    .get(i)
                    .ok_or_else(|| Error::DecodeError("packbits run overruns input".into()))?;
                out.extend(std::iter::repeat(value).take(n as usize));
                i += 1;
            }
        }
    }
    if out.len() != expected {
        return Err(Error::DecodeError(format!(
            "packbits row decoded to {} bytes, expected {}",
            out.len(),
            expected
        )));
    }
    Ok(out)
}

fn run_length(data: &[u8]) -> usize {
    let first = data[0];
    data.iter().take(128).take_while(|&&b| b == first).count()
}
