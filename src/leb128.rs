use crate::error::Error::*;
use crate::error::*;

/// Strict decoder used while loading: rejects overlong and out-of-range encodings.
#[inline]
pub fn safe_read_leb128<T>(bytes: &[u8], pc: &mut usize, bits: u8) -> Result<T, Error>
where T: TryFrom<u64> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    let mut end = *pc;
    loop {
        let byte = *bytes.get(end).ok_or(Malformed(UNEXPECTED_END))?;
        end += 1;
        if shift < 64 {
            result |= ((byte & 0x7f) as u64) << shift;
        }
        if byte & 0x80 == 0 { break; }
        shift += 7;
    }
    let consumed = end - *pc;
    if consumed > (bits as usize).div_ceil(7) { return Err(Malformed(INT_TOO_LONG)); }
    if bits < 64 && result >> bits != 0 { return Err(Malformed(INT_TOO_LARGE)); }

    if consumed > 1 {
        let used = (consumed - 1) * 7;
        if used < bits as usize {
            let rem = bits as usize - used;
            if rem < 8 && (bytes[end - 1] as u32) >> rem != 0 { return Err(Malformed(INT_TOO_LARGE)); }
        }
    }
    *pc = end;
    T::try_from(result).map_err(|_| Malformed(INT_TOO_LARGE))
}

#[inline]
pub fn safe_read_sleb128<T>(bytes: &[u8], pc: &mut usize, bits: u8) -> Result<T, Error>
where T: TryFrom<i64> {
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    let mut end = *pc;
    let mut byte: u8;
    loop {
        byte = *bytes.get(end).ok_or(Malformed(UNEXPECTED_END))?;
        end += 1;
        if shift < 63 {
            result |= ((byte & 0x7f) as i64) << shift;
        }
        shift = (shift + 7).min(63);
        if byte & 0x80 == 0 { break; }
    }
    if shift < 63 && (byte & 0x40) != 0 {
        result |= !0i64 << shift;
    }
    let consumed = end - *pc;
    if consumed > (bits as usize).div_ceil(7) { return Err(Malformed(INT_TOO_LONG)); }

    if bits < 64 {
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        if result < min || result > max { return Err(Malformed(INT_TOO_LARGE)); }
    }
    *pc = end;
    T::try_from(result).map_err(|_| Malformed(INT_TOO_LARGE))
}

/// Lenient decoder for already-validated code (interpreter, CSP replay).
#[inline(always)]
pub fn read_leb128<T>(bytes: &[u8], pc: &mut usize) -> Result<T, Error>
where T: TryFrom<u64> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = *bytes.get(*pc).ok_or(Malformed(UNEXPECTED_END))?;
        *pc += 1;
        if shift < 64 {
            result |= ((byte & 0x7f) as u64) << shift;
        }
        if byte & 0x80 == 0 {
            return T::try_from(result).map_err(|_| Malformed(INT_TOO_LARGE));
        }
        shift += 7;
    }
}

#[inline(always)]
pub fn read_sleb128<T>(bytes: &[u8], pc: &mut usize) -> Result<T, Error>
where T: TryFrom<i64> {
    let mut result: i64 = 0;
    let mut shift: u32 = 0;
    let mut byte: u8;
    loop {
        byte = *bytes.get(*pc).ok_or(Malformed(UNEXPECTED_END))?;
        *pc += 1;
        if shift < 63 {
            result |= ((byte & 0x7f) as i64) << shift;
        }
        shift = (shift + 7).min(63);
        if byte & 0x80 == 0 { break; }
    }
    if shift < 63 && (byte & 0x40) != 0 {
        result |= !0i64 << shift;
    }
    T::try_from(result).map_err(|_| Malformed(INT_TOO_LARGE))
}

#[inline(always)]
pub fn skip_leb128(bytes: &[u8], pc: &mut usize) -> Result<(), Error> {
    loop {
        let byte = *bytes.get(*pc).ok_or(Malformed(UNEXPECTED_END))?;
        *pc += 1;
        if byte & 0x80 == 0 { return Ok(()); }
    }
}
