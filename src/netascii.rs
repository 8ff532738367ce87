// NETASCII is ASCII where every line ends in CR LF and a bare CR (one not
// followed by LF) travels as CR NUL. A NUL that is not part of CR NUL is
// illegal and gets stripped.
//
// Both directions are streaming: a CR sitting at the end of one 512-byte
// block must influence how the first byte of the next block is handled, so
// each translator carries its undecided byte between calls. Call `finish`
// once the input is exhausted to flush a trailing carry.

/// The byte carried across block boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Carry {
    None,
    PendingCr,
}

const NUL: u8 = 0x00;
const LF: u8 = 0x0A;
const CR: u8 = 0x0D;

/// Translates host-native text into NETASCII (applied during uploads).
#[derive(Debug)]
pub struct Encoder {
    carry: Carry,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder { carry: Carry::None }
    }

    /// Encodes `input`, appending the translation to `out`.
    ///
    /// A trailing CR in `input` is held back until the next call (or
    /// `finish`) decides whether it starts a CR LF pair.
    pub fn encode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &byte in input {
            if self.carry == Carry::PendingCr {
                self.carry = Carry::None;
                if byte == LF {
                    // The CR already went out; completing the pair makes CR LF.
                    out.push(LF);
                    continue;
                }
                // The CR turned out to be bare, so it travels as CR NUL.
                out.push(NUL);
            }

            match byte {
                NUL => {}
                LF => {
                    out.push(CR);
                    out.push(LF);
                }
                CR => {
                    out.push(CR);
                    self.carry = Carry::PendingCr;
                }
                other => out.push(other),
            }
        }
    }

    /// Flushes an undecided trailing CR as the bare-CR encoding CR NUL.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if self.carry == Carry::PendingCr {
            self.carry = Carry::None;
            out.push(NUL);
        }
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Translates NETASCII back into host-native text (applied during downloads).
#[derive(Debug)]
pub struct Decoder {
    carry: Carry,
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder { carry: Carry::None }
    }

    /// Decodes `input`, appending the translation to `out`.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &byte in input {
            if self.carry == Carry::PendingCr {
                self.carry = Carry::None;
                match byte {
                    LF => out.push(LF),
                    NUL => out.push(CR),
                    other => {
                        out.push(CR);
                        out.push(other);
                    }
                }
                continue;
            }

            if byte == CR {
                self.carry = Carry::PendingCr;
            } else {
                out.push(byte);
            }
        }
    }

    /// Flushes an undecided trailing CR verbatim.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if self.carry == Carry::PendingCr {
            self.carry = Carry::None;
            out.push(CR);
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(input: &[u8]) -> Vec<u8> {
        let mut encoder = Encoder::new();
        let mut out = Vec::new();
        encoder.encode(input, &mut out);
        encoder.finish(&mut out);
        out
    }

    fn decode_all(input: &[u8]) -> Vec<u8> {
        let mut decoder = Decoder::new();
        let mut out = Vec::new();
        decoder.decode(input, &mut out);
        decoder.finish(&mut out);
        out
    }

    #[test]
    fn test_encode_mixed_line_endings() {
        assert_eq!(
            encode_all(b"Line1\nLine2\rLine3\r\nEnd"),
            b"Line1\r\nLine2\r\0Line3\r\nEnd".to_vec()
        );
    }

    #[test]
    fn test_encode_bare_cr_at_end_of_input() {
        assert_eq!(encode_all(b"abc\r"), b"abc\r\0".to_vec());
    }

    #[test]
    fn test_encode_strips_nul() {
        assert_eq!(encode_all(b"a\0b"), b"ab".to_vec());
    }

    #[test]
    fn test_encode_carry_across_blocks() {
        // A CR ending block N must join with an LF opening block N+1.
        let mut encoder = Encoder::new();
        let mut out = Vec::new();
        encoder.encode(b"abc\r", &mut out);
        encoder.encode(b"\ndef", &mut out);
        encoder.finish(&mut out);
        assert_eq!(out, b"abc\r\ndef".to_vec());
    }

    #[test]
    fn test_decode_crlf_and_crnul() {
        assert_eq!(
            decode_all(b"Line1\r\nLine2\r\0Line3\r\nEnd"),
            b"Line1\nLine2\rLine3\nEnd".to_vec()
        );
    }

    #[test]
    fn test_decode_stray_cr_pairs() {
        // CR followed by anything other than LF or NUL passes both through.
        assert_eq!(decode_all(b"a\rb"), b"a\rb".to_vec());
    }

    #[test]
    fn test_decode_trailing_cr() {
        assert_eq!(decode_all(b"abc\r"), b"abc\r".to_vec());
    }

    #[test]
    fn test_decode_carry_across_blocks() {
        let mut decoder = Decoder::new();
        let mut out = Vec::new();
        decoder.decode(b"abc\r", &mut out);
        decoder.decode(b"\ndef\r", &mut out);
        decoder.decode(b"\0ghi", &mut out);
        decoder.finish(&mut out);
        assert_eq!(out, b"abc\ndef\rghi".to_vec());
    }

    #[test]
    fn test_round_trip() {
        // decode(encode(x)) == x for NUL-free 7-bit input where a CR never
        // immediately precedes an LF (host CR LF normalizes to a single LF).
        let inputs: [&[u8]; 4] = [
            b"plain text without endings",
            b"unix\nendings\nonly\n",
            b"mac\rendings\r",
            b"",
        ];

        for input in inputs {
            assert_eq!(decode_all(&encode_all(input)), input.to_vec());
        }
    }

    #[test]
    fn test_crlf_normalizes_to_lf() {
        assert_eq!(decode_all(&encode_all(b"dos\r\nendings\r\n")), b"dos\nendings\n".to_vec());
    }
}
