//! LZF decompression for compressed RDB strings.
//!
//! The stream is a sequence of control bytes. A control byte below 32
//! starts a literal run of `ctrl + 1` bytes; anything else is a back
//! reference of length `(ctrl >> 5) + 2` (with an extension byte when the
//! 3-bit length field is 7) at distance `((ctrl & 0x1f) << 8 | next) + 1`.

use crate::rdb::FormatError;

/// Decompresses `input`, which must expand to exactly `expected_len` bytes.
pub fn decompress(input: &[u8], expected_len: usize) -> Result<Vec<u8>, FormatError> {
    let mut output = Vec::with_capacity(expected_len);
    let mut ip = 0;

    while ip < input.len() {
        let ctrl = input[ip] as usize;
        ip += 1;

        if ctrl < 32 {
            let run = ctrl + 1;
            let literal = input
                .get(ip..ip + run)
                .ok_or_else(|| lzf_error("literal run past end of input"))?;
            output.extend_from_slice(literal);
            ip += run;
            continue;
        }

        let mut len = ctrl >> 5;
        if len == 7 {
            len += *input
                .get(ip)
                .ok_or_else(|| lzf_error("missing length extension"))? as usize;
            ip += 1;
        }
        len += 2;

        let low = *input
            .get(ip)
            .ok_or_else(|| lzf_error("missing back reference offset"))? as usize;
        ip += 1;
        let distance = ((ctrl & 0x1f) << 8 | low) + 1;
        let start = output
            .len()
            .checked_sub(distance)
            .ok_or_else(|| lzf_error("back reference before start of output"))?;

        // Byte by byte: the reference may overlap the bytes it produces.
        for i in start..start + len {
            let byte = output[i];
            output.push(byte);
        }

        if output.len() > expected_len {
            return Err(lzf_error("output longer than declared"));
        }
    }

    if output.len() != expected_len {
        return Err(lzf_error("output shorter than declared"));
    }
    Ok(output)
}

fn lzf_error(detail: &str) -> FormatError {
    FormatError::Lzf(detail.to_string())
}
