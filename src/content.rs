//! Content-stream color operator rewriting.
//!
//! The rewriter scans the raw content bytes itself instead of re-encoding a
//! parsed operation list: only the exact byte ranges covering rewritten
//! color operators change, everything else (whitespace, comments, strings,
//! inline images, operators it does not touch) survives byte-for-byte.
//! Content is treated as bytes end to end; it never passes through a text
//! decoder, so bytes 0x80..0x9F inside operands cannot be remapped.

use log::{debug, warn};
use smallvec::SmallVec;

use crate::buffer::{BufferConvertOptions, BufferConverter};
use crate::engine::{Endianness, PixelColor, ProfileHandle, RenderingIntent};
use crate::errors::ConvertResult;
use crate::policy::ConversionCategory;

/// Resource name under which the page converter registers the destination
/// ICCBased color space.
pub const DEST_COLOR_SPACE_RESOURCE: &[u8] = b"ICCDest";

/// Source profiles used to interpret device-space operands. A missing
/// profile leaves the matching operators untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentSourceProfiles {
    pub gray: Option<ProfileHandle>,
    pub rgb: Option<ProfileHandle>,
    pub cmyk: Option<ProfileHandle>,
}

/// Settings for one content-stream rewrite.
#[derive(Debug, Clone)]
pub struct ContentConvertSettings {
    pub sources: ContentSourceProfiles,
    pub destination: ProfileHandle,
    pub destination_family: PixelColor,
    pub intermediates: Vec<ProfileHandle>,
    pub intent: RenderingIntent,
    pub black_point_compensation: bool,
    pub adaptive_bpc_clamping: bool,
}

/// Outcome of a rewrite: the new bytes plus how many operators changed.
#[derive(Debug)]
pub struct ContentRewriteOutcome {
    pub bytes: Vec<u8>,
    pub rewritten_ops: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Number(f32),
    Name(Vec<u8>),
    /// Strings, arrays, dictionaries: present but never convertible.
    Complex,
}

struct Edit {
    start: usize,
    end: usize,
    replacement: Vec<u8>,
}

pub struct ContentConverter<'a> {
    buffer: &'a mut BufferConverter,
    settings: ContentConvertSettings,
    warned_missing_source: bool,
}

impl<'a> ContentConverter<'a> {
    pub fn new(buffer: &'a mut BufferConverter, settings: ContentConvertSettings) -> Self {
        ContentConverter {
            buffer,
            settings,
            warned_missing_source: false,
        }
    }

    /// Rewrites every color-setting operator in `data` and returns the new
    /// stream bytes.
    pub fn convert_content(&mut self, data: &[u8]) -> ConvertResult<ContentRewriteOutcome> {
        let mut scanner = Scanner::new(data);
        let mut operands: SmallVec<[Operand; 8]> = SmallVec::new();
        let mut run_start: Option<usize> = None;
        let mut edits: Vec<Edit> = Vec::new();

        while let Some(token) = scanner.next_token() {
            match token {
                ScannedToken::Operand { start, operand } => {
                    if run_start.is_none() {
                        run_start = Some(start);
                    }
                    operands.push(operand);
                }
                ScannedToken::Operator { start, end, bytes } => {
                    if bytes == b"BI" {
                        // Inline image: opaque up to and including EI.
                        scanner.skip_inline_image();
                        operands.clear();
                        run_start = None;
                        continue;
                    }
                    let span_start = run_start.unwrap_or(start);
                    if let Some(replacement) = self.rewrite_operator(&bytes, &operands)? {
                        edits.push(Edit {
                            start: span_start,
                            end,
                            replacement,
                        });
                    }
                    operands.clear();
                    run_start = None;
                }
                ScannedToken::Noise => {}
            }
        }

        let rewritten_ops = edits.len();
        if rewritten_ops == 0 {
            return Ok(ContentRewriteOutcome {
                bytes: data.to_vec(),
                rewritten_ops,
            });
        }

        let mut out = Vec::with_capacity(data.len());
        let mut cursor = 0usize;
        for edit in &edits {
            out.extend_from_slice(&data[cursor..edit.start]);
            out.extend_from_slice(&edit.replacement);
            cursor = edit.end;
        }
        out.extend_from_slice(&data[cursor..]);

        debug!("rewrote {rewritten_ops} color operators in content stream");
        Ok(ContentRewriteOutcome {
            bytes: out,
            rewritten_ops,
        })
    }

    /// Returns the replacement bytes for a color-setting operator, or
    /// `None` when the operator is left untouched.
    fn rewrite_operator(
        &mut self,
        op: &[u8],
        operands: &[Operand],
    ) -> ConvertResult<Option<Vec<u8>>> {
        let stroke = matches!(op, b"G" | b"RG" | b"K" | b"SC" | b"SCN" | b"CS");
        match op {
            b"g" | b"G" => self.rewrite_components(PixelColor::Gray, operands, stroke, op),
            b"rg" | b"RG" => self.rewrite_components(PixelColor::Rgb, operands, stroke, op),
            b"k" | b"K" => self.rewrite_components(PixelColor::Cmyk, operands, stroke, op),
            b"sc" | b"SC" | b"scn" | b"SCN" => {
                if operands.iter().any(|o| matches!(o, Operand::Name(_) | Operand::Complex)) {
                    // Pattern selection; not color-managed.
                    return Ok(None);
                }
                let family = match operands.len() {
                    1 => PixelColor::Gray,
                    3 => PixelColor::Rgb,
                    4 => PixelColor::Cmyk,
                    _ => return Ok(None),
                };
                let Some(values) = self.convert_numbers(family, operands)? else {
                    return Ok(None);
                };
                Ok(Some(render_operator(&values, op)))
            }
            b"cs" | b"CS" => {
                match operands {
                    [Operand::Name(name)] if name != b"Pattern" => {
                        let mut replacement = Vec::with_capacity(DEST_COLOR_SPACE_RESOURCE.len() + 4);
                        replacement.push(b'/');
                        replacement.extend_from_slice(DEST_COLOR_SPACE_RESOURCE);
                        replacement.push(b' ');
                        replacement.extend_from_slice(op);
                        Ok(Some(replacement))
                    }
                    _ => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    fn rewrite_components(
        &mut self,
        family: PixelColor,
        operands: &[Operand],
        stroke: bool,
        original_op: &[u8],
    ) -> ConvertResult<Option<Vec<u8>>> {
        if operands.len() != family.channels()
            || operands.iter().any(|o| !matches!(o, Operand::Number(_)))
        {
            debug!(
                "leaving malformed {} operator untouched",
                String::from_utf8_lossy(original_op)
            );
            return Ok(None);
        }
        let Some(values) = self.convert_numbers(family, operands)? else {
            return Ok(None);
        };
        let op: &[u8] = match (self.settings.destination_family, stroke) {
            (PixelColor::Gray, false) => b"g",
            (PixelColor::Gray, true) => b"G",
            (PixelColor::Rgb, false) => b"rg",
            (PixelColor::Rgb, true) => b"RG",
            (PixelColor::Cmyk, false) => b"k",
            (PixelColor::Cmyk, true) => b"K",
            (PixelColor::Lab, _) => return Ok(None),
        };
        Ok(Some(render_operator(&values, op)))
    }

    /// Converts numeric operands through the buffer converter using the
    /// 16-bit native path. Returns `None` when the implicit source space
    /// has no profile configured.
    fn convert_numbers(
        &mut self,
        family: PixelColor,
        operands: &[Operand],
    ) -> ConvertResult<Option<Vec<f32>>> {
        let source = match family {
            PixelColor::Gray => self.settings.sources.gray,
            PixelColor::Rgb => self.settings.sources.rgb,
            PixelColor::Cmyk => self.settings.sources.cmyk,
            PixelColor::Lab => None,
        };
        let Some(source) = source else {
            if !self.warned_missing_source {
                warn!(
                    "no source profile configured for {:?} operators; leaving them untouched",
                    family
                );
                self.warned_missing_source = true;
            }
            return Ok(None);
        };

        let input: Vec<u8> = operands
            .iter()
            .flat_map(|o| {
                let Operand::Number(v) = o else { unreachable!() };
                (((v.clamp(0.0, 1.0)) * 65535.0).round() as u16).to_ne_bytes()
            })
            .collect();

        let mut opts = BufferConvertOptions::new(source, self.settings.destination);
        opts.intermediates = self.settings.intermediates.clone();
        opts.bits_per_component = Some(16);
        opts.input_endianness = Some(Endianness::native());
        opts.output_endianness = Some(Endianness::native());
        opts.intent = self.settings.intent;
        opts.black_point_compensation = self.settings.black_point_compensation;
        opts.adaptive_bpc_clamping = self.settings.adaptive_bpc_clamping;
        opts.category = ConversionCategory::ContentStream;

        let out = self.buffer.convert(&input, &opts)?;
        let values = out
            .bytes
            .chunks_exact(2)
            .map(|pair| {
                let mut bytes = [0u8; 2];
                bytes.copy_from_slice(pair);
                u16::from_ne_bytes(bytes) as f32 / 65535.0
            })
            .collect();
        Ok(Some(values))
    }
}

fn render_operator(values: &[f32], op: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 7 + op.len());
    for value in values {
        out.extend_from_slice(format_number(*value).as_bytes());
        out.push(b' ');
    }
    out.extend_from_slice(op);
    out
}

/// Formats an operand the way PDF writers do: up to four decimals, no
/// trailing zeros.
fn format_number(value: f32) -> String {
    let mut s = format!("{value:.4}");
    while s.contains('.') && (s.ends_with('0') || s.ends_with('.')) {
        s.pop();
    }
    if s.is_empty() || s == "-" {
        s = "0".to_string();
    }
    s
}

// --- content tokenizer ----------------------------------------------------

enum ScannedToken {
    Operand { start: usize, operand: Operand },
    Operator { start: usize, end: usize, bytes: Vec<u8> },
    Noise,
}

struct Scanner<'b> {
    data: &'b [u8],
    pos: usize,
}

fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b'\0' | b'\t' | b'\n' | b'\x0c' | b'\r' | b' ')
}

fn is_delimiter(byte: u8) -> bool {
    matches!(byte, b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%')
}

fn is_regular(byte: u8) -> bool {
    !is_whitespace(byte) && !is_delimiter(byte)
}

impl<'b> Scanner<'b> {
    fn new(data: &'b [u8]) -> Self {
        Scanner { data, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn next_token(&mut self) -> Option<ScannedToken> {
        while let Some(byte) = self.peek() {
            if is_whitespace(byte) {
                self.pos += 1;
                continue;
            }
            break;
        }
        let start = self.pos;
        let byte = self.peek()?;

        match byte {
            b'%' => {
                while let Some(b) = self.peek() {
                    self.pos += 1;
                    if b == b'\n' || b == b'\r' {
                        break;
                    }
                }
                Some(ScannedToken::Noise)
            }
            b'(' => {
                self.skip_literal_string();
                Some(ScannedToken::Operand {
                    start,
                    operand: Operand::Complex,
                })
            }
            b'<' => {
                if self.data.get(self.pos + 1) == Some(&b'<') {
                    self.pos += 2;
                } else {
                    self.pos += 1;
                    while let Some(b) = self.peek() {
                        self.pos += 1;
                        if b == b'>' {
                            break;
                        }
                    }
                }
                Some(ScannedToken::Operand {
                    start,
                    operand: Operand::Complex,
                })
            }
            b'>' => {
                // `>>` dictionary close; a bare `>` cannot appear here.
                self.pos += if self.data.get(self.pos + 1) == Some(&b'>') { 2 } else { 1 };
                Some(ScannedToken::Operand {
                    start,
                    operand: Operand::Complex,
                })
            }
            b'[' | b']' | b'{' | b'}' => {
                self.pos += 1;
                Some(ScannedToken::Operand {
                    start,
                    operand: Operand::Complex,
                })
            }
            b'/' => {
                self.pos += 1;
                let name_start = self.pos;
                while self.peek().map_or(false, is_regular) {
                    self.pos += 1;
                }
                Some(ScannedToken::Operand {
                    start,
                    operand: Operand::Name(self.data[name_start..self.pos].to_vec()),
                })
            }
            b'+' | b'-' | b'.' | b'0'..=b'9' => {
                while self.peek().map_or(false, is_regular) {
                    self.pos += 1;
                }
                let text = std::str::from_utf8(&self.data[start..self.pos]).ok();
                match text.and_then(|t| t.parse::<f32>().ok()) {
                    Some(value) => Some(ScannedToken::Operand {
                        start,
                        operand: Operand::Number(value),
                    }),
                    None => Some(ScannedToken::Operand {
                        start,
                        operand: Operand::Complex,
                    }),
                }
            }
            _ => {
                while self.peek().map_or(false, is_regular) {
                    self.pos += 1;
                }
                let bytes = self.data[start..self.pos].to_vec();
                match bytes.as_slice() {
                    b"true" | b"false" | b"null" => Some(ScannedToken::Operand {
                        start,
                        operand: Operand::Complex,
                    }),
                    _ => Some(ScannedToken::Operator {
                        start,
                        end: self.pos,
                        bytes,
                    }),
                }
            }
        }
    }

    fn skip_literal_string(&mut self) {
        debug_assert_eq!(self.peek(), Some(b'('));
        self.pos += 1;
        let mut depth = 1usize;
        while let Some(b) = self.peek() {
            self.pos += 1;
            match b {
                b'\\' => {
                    // Escaped byte, never a delimiter.
                    if self.peek().is_some() {
                        self.pos += 1;
                    }
                }
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    /// Skips the remainder of an inline image (the scanner already consumed
    /// `BI`): dictionary tokens, `ID`, the binary payload, and `EI`.
    fn skip_inline_image(&mut self) {
        // Find the ID keyword.
        loop {
            match self.next_token() {
                Some(ScannedToken::Operator { bytes, .. }) if bytes == b"ID" => break,
                Some(_) => continue,
                None => return,
            }
        }
        // One whitespace byte separates ID from the payload.
        if self.peek().map_or(false, is_whitespace) {
            self.pos += 1;
        }
        // Scan for whitespace-delimited EI.
        while self.pos + 1 < self.data.len() {
            if self.data[self.pos] == b'E'
                && self.data[self.pos + 1] == b'I'
                && (self.pos == 0 || is_whitespace(self.data[self.pos - 1]))
                && self
                    .data
                    .get(self.pos + 2)
                    .map_or(true, |&b| is_whitespace(b) || is_delimiter(b))
            {
                self.pos += 2;
                return;
            }
            self.pos += 1;
        }
        self.pos = self.data.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::LogContext;
    use crate::engine::BuiltinProfile;
    use pretty_assertions::assert_eq;

    fn rgb_settings(buffer: &mut BufferConverter) -> ContentConvertSettings {
        let srgb = buffer.builtin(BuiltinProfile::SRgb).unwrap();
        let gray = buffer.builtin(BuiltinProfile::SGray).unwrap();
        ContentConvertSettings {
            sources: ContentSourceProfiles {
                gray: Some(gray),
                rgb: Some(srgb),
                cmyk: None,
            },
            destination: srgb,
            destination_family: PixelColor::Rgb,
            intermediates: Vec::new(),
            intent: RenderingIntent::RelativeColorimetric,
            black_point_compensation: false,
            adaptive_bpc_clamping: false,
        }
    }

    fn rewrite(content: &[u8]) -> ContentRewriteOutcome {
        let mut buffer = BufferConverter::new(LogContext::default());
        let settings = rgb_settings(&mut buffer);
        let mut converter = ContentConverter::new(&mut buffer, settings);
        converter.convert_content(content).unwrap()
    }

    #[test]
    fn gray_fill_becomes_rgb_triple() {
        let out = rewrite(b"1 0 0 1 0 0 cm\n0 g\n0 0 10 10 re f\n");
        let text = String::from_utf8(out.bytes).unwrap();
        assert_eq!(out.rewritten_ops, 1);
        assert!(text.contains(" rg\n"), "gray op became rg: {text}");
        assert!(!text.contains(" g\n"));
        assert!(text.starts_with("1 0 0 1 0 0 cm\n"), "untouched prefix survives");
        assert!(text.ends_with("0 0 10 10 re f\n"), "untouched suffix survives");
    }

    #[test]
    fn stroke_case_is_preserved() {
        let out = rewrite(b"0.2 0.4 0.6 RG S");
        let text = String::from_utf8(out.bytes).unwrap();
        assert!(text.ends_with("RG S"));
        assert_eq!(out.rewritten_ops, 1);
    }

    #[test]
    fn byte_0x92_survives_in_untouched_operators() {
        let content = b"BT (A\x92B) Tj ET 0.5 g".to_vec();
        let out = rewrite(&content);
        let pos = out.bytes.windows(4).position(|w| w == b"A\x92B)").unwrap();
        assert_eq!(&out.bytes[pos..pos + 4], b"A\x92B)");
        assert_eq!(out.rewritten_ops, 1);
        assert_eq!(&out.bytes[..content.len() - 5], &content[..content.len() - 5]);
    }

    #[test]
    fn comments_and_whitespace_outside_edits_survive() {
        let content = b"% header comment\n1 0 0 1 50  60 cm\n0.5 g\nq Q";
        let out = rewrite(content);
        let text = String::from_utf8(out.bytes).unwrap();
        assert!(text.starts_with("% header comment\n1 0 0 1 50  60 cm\n"));
        assert!(text.ends_with("\nq Q"));
    }

    #[test]
    fn cs_selection_points_at_destination_resource() {
        let out = rewrite(b"/CS12 cs /CS12 CS");
        let text = String::from_utf8(out.bytes).unwrap();
        assert_eq!(text, "/ICCDest cs /ICCDest CS");
        assert_eq!(out.rewritten_ops, 2);
    }

    #[test]
    fn pattern_selection_is_untouched() {
        let content = b"/Pattern cs /P1 scn";
        let out = rewrite(content);
        assert_eq!(out.bytes, content);
        assert_eq!(out.rewritten_ops, 0);
    }

    #[test]
    fn scn_with_three_numbers_uses_implicit_rgb() {
        let out = rewrite(b"0.1 0.2 0.3 scn");
        let text = String::from_utf8(out.bytes).unwrap();
        assert!(text.ends_with("scn"));
        assert_eq!(out.rewritten_ops, 1);
    }

    #[test]
    fn cmyk_without_source_profile_is_left_alone() {
        let content = b"0.1 0.2 0.3 0.4 k";
        let out = rewrite(content);
        assert_eq!(out.bytes, content);
        assert_eq!(out.rewritten_ops, 0);
    }

    #[test]
    fn inline_images_are_opaque() {
        let content =
            b"BI /W 2 /H 1 /CS /RGB /BPC 8 ID \x00\x92\xff\x10\x20\x30 EI 0.5 g".to_vec();
        let out = rewrite(&content);
        let text_tail = &out.bytes[out.bytes.len() - 2..];
        assert_eq!(text_tail, b"rg");
        let payload_pos = out
            .bytes
            .windows(6)
            .position(|w| w == b"\x00\x92\xff\x10\x20\x30")
            .expect("inline image payload untouched");
        assert!(payload_pos > 0);
    }

    #[test]
    fn number_formatting_trims_zeros() {
        assert_eq!(format_number(1.0), "1");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(0.1234), "0.1234");
        assert_eq!(format_number(0.0), "0");
    }

    #[test]
    fn identity_rgb_values_stay_close() {
        let out = rewrite(b"1 0 0 rg");
        let text = String::from_utf8(out.bytes).unwrap();
        let parts: Vec<f32> = text
            .trim_end_matches(" rg")
            .split(' ')
            .map(|p| p.parse().unwrap())
            .collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0] > 0.99 && parts[1] < 0.01 && parts[2] < 0.01, "{text}");
    }
}
