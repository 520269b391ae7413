use super::RpcError;

const MAX_IMSI_DIGITS: usize = 15;
const MAX_LEADING_ZEROS: usize = 3;

/// Pack an IMSI ("IMSI001010000000001" or bare digits) into the 64-bit metadata field.
/// The low two bits hold the number of leading zeros, which an integer would lose.
pub fn encode_imsi(imsi: &str) -> Result<u64, RpcError> {
    let digits = imsi.strip_prefix("IMSI").unwrap_or(imsi);
    if digits.is_empty()
        || digits.len() > MAX_IMSI_DIGITS
        || !digits.chars().all(|c| c.is_ascii_digit())
    {
        return Err(RpcError::InvalidArgument(format!("bad IMSI {imsi}")));
    }
    let leading_zeros = digits.len() - digits.trim_start_matches('0').len();
    if leading_zeros > MAX_LEADING_ZEROS {
        return Err(RpcError::InvalidArgument(format!(
            "IMSI {imsi} has more than {MAX_LEADING_ZEROS} leading zeros"
        )));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| RpcError::InvalidArgument(format!("bad IMSI {imsi}")))?;
    Ok((value << 2) | leading_zeros as u64)
}

pub fn decode_imsi(encoded: u64) -> String {
    let leading_zeros = (encoded & 0x3) as usize;
    let value = encoded >> 2;
    let zeros = "0".repeat(leading_zeros);
    if value == 0 {
        format!("IMSI{zeros}")
    } else {
        format!("IMSI{zeros}{value}")
    }
}
