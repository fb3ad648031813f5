// RFC 4515 search filter strings <-> BER Filter packets

use crate::ber::{Class, Encoding, Packet};
use crate::error::{LdapError, Result};

// Filter CHOICE context tags (RFC 4511 4.5.1)
pub const FILTER_AND: u32 = 0;
pub const FILTER_OR: u32 = 1;
pub const FILTER_NOT: u32 = 2;
pub const FILTER_EQUALITY: u32 = 3;
pub const FILTER_SUBSTRINGS: u32 = 4;
pub const FILTER_GREATER_OR_EQUAL: u32 = 5;
pub const FILTER_LESS_OR_EQUAL: u32 = 6;
pub const FILTER_PRESENT: u32 = 7;
pub const FILTER_APPROX: u32 = 8;
pub const FILTER_EXTENSIBLE: u32 = 9;

const SUBSTRING_INITIAL: u32 = 0;
const SUBSTRING_ANY: u32 = 1;
const SUBSTRING_FINAL: u32 = 2;

const MAX_NESTING: usize = 32;

fn compile_error(msg: impl Into<String>) -> LdapError {
    LdapError::FilterCompile(msg.into())
}

/// Compile a filter string such as `(&(objectClass=person)(cn=J*))`.
/// A filter without surrounding parentheses is accepted as a single item.
pub fn compile_filter(filter: &str) -> Result<Packet> {
    let trimmed = filter.trim();
    if trimmed.is_empty() {
        return Err(compile_error("empty filter"));
    }
    let wrapped;
    let source = if trimmed.starts_with('(') {
        trimmed
    } else {
        wrapped = format!("({})", trimmed);
        wrapped.as_str()
    };
    let mut parser = Parser {
        input: source,
        pos: 0,
    };
    let packet = parser.filter(0)?;
    if parser.pos != source.len() {
        return Err(compile_error(format!(
            "unexpected trailing input at offset {}",
            parser.pos
        )));
    }
    Ok(packet)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn expect(&mut self, wanted: u8) -> Result<()> {
        match self.peek() {
            Some(c) if c == wanted => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(compile_error(format!(
                "expected '{}' at offset {}, found '{}'",
                wanted as char, self.pos, c as char
            ))),
            None => Err(compile_error(format!(
                "expected '{}' at end of filter",
                wanted as char
            ))),
        }
    }

    fn filter(&mut self, depth: usize) -> Result<Packet> {
        if depth > MAX_NESTING {
            return Err(compile_error(format!("filter nested deeper than {}", MAX_NESTING)));
        }
        self.expect(b'(')?;
        let packet = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                self.set(FILTER_AND, "AND", depth)?
            }
            Some(b'|') => {
                self.pos += 1;
                self.set(FILTER_OR, "OR", depth)?
            }
            Some(b'!') => {
                self.pos += 1;
                let inner = self.filter(depth + 1)?;
                Packet::constructed(Class::Context, FILTER_NOT, "NOT").with_child(inner)
            }
            Some(_) => self.item()?,
            None => return Err(compile_error("unexpected end of filter")),
        };
        self.expect(b')')?;
        Ok(packet)
    }

    // An empty set is the RFC 4526 absolute true/false filter.
    fn set(&mut self, tag: u32, description: &str, depth: usize) -> Result<Packet> {
        let mut packet = Packet::constructed(Class::Context, tag, description);
        while self.peek() == Some(b'(') {
            packet.append_child(self.filter(depth + 1)?);
        }
        Ok(packet)
    }

    fn item(&mut self) -> Result<Packet> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == b')' || c == b'(' {
                break;
            }
            self.pos += 1;
        }
        parse_item(&self.input[start..self.pos])
    }
}

fn parse_item(text: &str) -> Result<Packet> {
    if let Some(idx) = text.find(":=") {
        return extensible(&text[..idx], &text[idx + 2..]);
    }
    let eq = text
        .find('=')
        .ok_or_else(|| compile_error(format!("missing '=' in filter item {:?}", text)))?;
    let (attr, tag, description) = match text[..eq].as_bytes().last() {
        Some(b'~') => (&text[..eq - 1], FILTER_APPROX, "Approx Match"),
        Some(b'>') => (&text[..eq - 1], FILTER_GREATER_OR_EQUAL, "Greater Or Equal"),
        Some(b'<') => (&text[..eq - 1], FILTER_LESS_OR_EQUAL, "Less Or Equal"),
        _ => (&text[..eq], FILTER_EQUALITY, "Equality Match"),
    };
    validate_attribute(attr)?;
    let raw = &text[eq + 1..];
    if tag == FILTER_EQUALITY {
        if raw == "*" {
            return Ok(Packet::context_primitive(FILTER_PRESENT, attr, "Present"));
        }
        if raw.contains('*') {
            return substrings(attr, raw);
        }
    }
    Ok(Packet::constructed(Class::Context, tag, description)
        .with_child(Packet::octet_string(attr, "Attribute"))
        .with_child(Packet::octet_string(unescape(raw)?, "Condition")))
}

fn substrings(attr: &str, raw: &str) -> Result<Packet> {
    let pieces: Vec<&str> = raw.split('*').collect();
    let last = pieces.len() - 1;
    let mut seq = Packet::sequence("Substrings");
    for (i, piece) in pieces.iter().enumerate() {
        if piece.is_empty() {
            continue;
        }
        let (tag, description) = if i == 0 {
            (SUBSTRING_INITIAL, "Initial")
        } else if i == last {
            (SUBSTRING_FINAL, "Final")
        } else {
            (SUBSTRING_ANY, "Any")
        };
        seq.append_child(Packet::context_primitive(tag, unescape(piece)?, description));
    }
    if seq.children.is_empty() {
        return Err(compile_error(format!("substrings filter for {} has no components", attr)));
    }
    Ok(Packet::constructed(Class::Context, FILTER_SUBSTRINGS, "Substrings")
        .with_child(Packet::octet_string(attr, "Attribute"))
        .with_child(seq))
}

// attr [":dn"] [":" rule] ":=" value, or [":dn"] ":" rule ":=" value
fn extensible(left: &str, raw: &str) -> Result<Packet> {
    let mut parts = left.split(':');
    let attr = parts.next().unwrap_or_default();
    let mut dn_attributes = false;
    let mut rule = None;
    for part in parts {
        if part.eq_ignore_ascii_case("dn") && !dn_attributes && rule.is_none() {
            dn_attributes = true;
        } else if rule.is_none() && !part.is_empty() {
            rule = Some(part);
        } else {
            return Err(compile_error(format!("malformed extensible match {:?}", left)));
        }
    }
    if attr.is_empty() && rule.is_none() {
        return Err(compile_error(
            "extensible match needs an attribute or a matching rule",
        ));
    }
    if !attr.is_empty() {
        validate_attribute(attr)?;
    }
    let mut packet = Packet::constructed(Class::Context, FILTER_EXTENSIBLE, "Extensible Match");
    if let Some(rule) = rule {
        packet.append_child(Packet::context_primitive(1, rule, "Matching Rule"));
    }
    if !attr.is_empty() {
        packet.append_child(Packet::context_primitive(2, attr, "Type"));
    }
    packet.append_child(Packet::context_primitive(3, unescape(raw)?, "Match Value"));
    if dn_attributes {
        packet.append_child(Packet::context_primitive(4, [0xFF], "DN Attributes"));
    }
    Ok(packet)
}

fn validate_attribute(attr: &str) -> Result<()> {
    if attr.is_empty() {
        return Err(compile_error("empty attribute description"));
    }
    if let Some(bad) = attr
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | ';' | '.' | '_')))
    {
        return Err(compile_error(format!(
            "invalid character {:?} in attribute {:?}",
            bad, attr
        )));
    }
    Ok(())
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

fn unescape(raw: &str) -> Result<Vec<u8>> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                let pair = bytes
                    .get(i + 1..i + 3)
                    .ok_or_else(|| compile_error("truncated escape sequence"))?;
                match (hex_digit(pair[0]), hex_digit(pair[1])) {
                    (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
                    _ => {
                        return Err(compile_error(format!(
                            "invalid escape sequence \\{}",
                            String::from_utf8_lossy(pair)
                        )))
                    }
                }
                i += 3;
            }
            c @ (b'*' | b'(' | b')') => {
                return Err(compile_error(format!(
                    "unescaped '{}' in filter value",
                    c as char
                )))
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

fn escape(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len());
    match std::str::from_utf8(value) {
        Ok(s) => {
            for c in s.chars() {
                match c {
                    '*' | '(' | ')' | '\\' | '\0' => out.push_str(&format!("\\{:02x}", c as u32)),
                    c => out.push(c),
                }
            }
        }
        Err(_) => {
            for b in value {
                out.push_str(&format!("\\{:02x}", b));
            }
        }
    }
    out
}

/// Render a Filter packet back to its string form.
pub fn decompile_filter(packet: &Packet) -> Result<String> {
    if packet.class != Class::Context {
        return Err(compile_error(format!("not a filter: class {:?}", packet.class)));
    }
    let mut out = String::from("(");
    match packet.tag {
        FILTER_AND | FILTER_OR | FILTER_NOT => {
            out.push(match packet.tag {
                FILTER_AND => '&',
                FILTER_OR => '|',
                _ => '!',
            });
            for child in &packet.children {
                out.push_str(&decompile_filter(child)?);
            }
        }
        FILTER_PRESENT => {
            out.push_str(&String::from_utf8_lossy(&packet.data));
            out.push_str("=*");
        }
        FILTER_SUBSTRINGS => {
            let attr = attribute_of(packet)?;
            let parts = packet
                .child(1)
                .ok_or_else(|| compile_error("substrings filter without components"))?;
            out.push_str(&attr);
            out.push('=');
            if !parts.child(0).is_some_and(|p| p.tag == SUBSTRING_INITIAL) {
                out.push('*');
            }
            for part in &parts.children {
                out.push_str(&escape(&part.data));
                if part.tag != SUBSTRING_FINAL {
                    out.push('*');
                }
            }
        }
        FILTER_EQUALITY | FILTER_GREATER_OR_EQUAL | FILTER_LESS_OR_EQUAL | FILTER_APPROX => {
            out.push_str(&attribute_of(packet)?);
            out.push_str(match packet.tag {
                FILTER_GREATER_OR_EQUAL => ">=",
                FILTER_LESS_OR_EQUAL => "<=",
                FILTER_APPROX => "~=",
                _ => "=",
            });
            let value = packet
                .child(1)
                .ok_or_else(|| compile_error("assertion without value"))?;
            out.push_str(&escape(&value.data));
        }
        FILTER_EXTENSIBLE => {
            let mut value = String::new();
            let (mut rule, mut attr, mut dn) = (String::new(), String::new(), false);
            for part in &packet.children {
                match part.tag {
                    1 => rule = String::from_utf8_lossy(&part.data).into_owned(),
                    2 => attr = String::from_utf8_lossy(&part.data).into_owned(),
                    3 => value = escape(&part.data),
                    4 => dn = part.data.first().is_some_and(|b| *b != 0),
                    _ => {}
                }
            }
            out.push_str(&attr);
            if dn {
                out.push_str(":dn");
            }
            if !rule.is_empty() {
                out.push(':');
                out.push_str(&rule);
            }
            out.push_str(":=");
            out.push_str(&value);
        }
        other => return Err(compile_error(format!("unknown filter tag {}", other))),
    }
    out.push(')');
    Ok(out)
}

fn attribute_of(packet: &Packet) -> Result<String> {
    let attr = packet
        .child(0)
        .filter(|c| c.encoding == Encoding::Primitive)
        .ok_or_else(|| compile_error("filter item without attribute"))?;
    Ok(String::from_utf8_lossy(&attr.data).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber;

    #[test]
    fn test_equality() {
        let p = compile_filter("(cn=John Doe)").unwrap();
        assert_eq!(p.class, Class::Context);
        assert_eq!(p.tag, FILTER_EQUALITY);
        assert_eq!(p.children[0].as_bytes(), b"cn");
        assert_eq!(p.children[1].as_bytes(), b"John Doe");
    }

    #[test]
    fn test_bare_item_is_wrapped() {
        assert_eq!(compile_filter("uid=alice").unwrap(), compile_filter("(uid=alice)").unwrap());
    }

    #[test]
    fn test_present() {
        let p = compile_filter("(objectClass=*)").unwrap();
        assert_eq!(p.tag, FILTER_PRESENT);
        assert!(!p.is_constructed());
        assert_eq!(p.as_bytes(), b"objectClass");
    }

    #[test]
    fn test_substrings() {
        let p = compile_filter("(cn=Jo*h*n)").unwrap();
        assert_eq!(p.tag, FILTER_SUBSTRINGS);
        let parts = &p.children[1].children;
        assert_eq!(parts.len(), 3);
        assert_eq!((parts[0].tag, parts[0].as_bytes()), (SUBSTRING_INITIAL, &b"Jo"[..]));
        assert_eq!((parts[1].tag, parts[1].as_bytes()), (SUBSTRING_ANY, &b"h"[..]));
        assert_eq!((parts[2].tag, parts[2].as_bytes()), (SUBSTRING_FINAL, &b"n"[..]));

        let p = compile_filter("(mail=*@example.com)").unwrap();
        let parts = &p.children[1].children;
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].tag, SUBSTRING_FINAL);
    }

    #[test]
    fn test_substrings_without_components() {
        for bad in ["(cn=**)", "(cn=***)"] {
            let err = compile_filter(bad).unwrap_err();
            assert!(matches!(err, LdapError::FilterCompile(_)), "{bad}: {err}");
        }
        assert_eq!(compile_filter("(cn=a**b)").unwrap().children[1].children.len(), 2);
    }

    #[test]
    fn test_ordering_and_approx() {
        assert_eq!(compile_filter("(uidNumber>=1000)").unwrap().tag, FILTER_GREATER_OR_EQUAL);
        assert_eq!(compile_filter("(uidNumber<=1000)").unwrap().tag, FILTER_LESS_OR_EQUAL);
        let p = compile_filter("(sn~=smith)").unwrap();
        assert_eq!(p.tag, FILTER_APPROX);
        assert_eq!(p.children[0].as_bytes(), b"sn");
    }

    #[test]
    fn test_nested_sets() {
        let p = compile_filter("(&(objectClass=person)(|(cn=a*)(!(sn=b))))").unwrap();
        assert_eq!(p.tag, FILTER_AND);
        assert_eq!(p.children.len(), 2);
        let or = &p.children[1];
        assert_eq!(or.tag, FILTER_OR);
        assert_eq!(or.children[1].tag, FILTER_NOT);
        assert_eq!(or.children[1].children[0].tag, FILTER_EQUALITY);
        // survives the codec
        assert_eq!(ber::decode(&p.serialize()).unwrap(), p);
    }

    #[test]
    fn test_escapes() {
        let p = compile_filter(r"(cn=a\2a\28b\29\5c)").unwrap();
        assert_eq!(p.tag, FILTER_EQUALITY);
        assert_eq!(p.children[1].as_bytes(), b"a*(b)\\");
        assert!(compile_filter(r"(cn=a\zz)").is_err());
        assert!(compile_filter(r"(cn=a\2)").is_err());
    }

    #[test]
    fn test_extensible() {
        let p = compile_filter("(cn:dn:2.4.6.8.10:=Dino)").unwrap();
        assert_eq!(p.tag, FILTER_EXTENSIBLE);
        let tags: Vec<u32> = p.children.iter().map(|c| c.tag).collect();
        assert_eq!(tags, vec![1, 2, 3, 4]);
        assert_eq!(p.children[0].as_bytes(), b"2.4.6.8.10");

        let p = compile_filter("(:caseExactMatch:=Fred)").unwrap();
        let tags: Vec<u32> = p.children.iter().map(|c| c.tag).collect();
        assert_eq!(tags, vec![1, 3]);

        assert!(compile_filter("(:=x)").is_err());
    }

    #[test]
    fn test_errors() {
        for bad in ["", "(cn=a", "(cn=a))", "(=a)", "(cn)", "(&(cn=a)", "(c n=a)", "(cn>=a*)"] {
            let err = compile_filter(bad).unwrap_err();
            assert!(matches!(err, LdapError::FilterCompile(_)), "{bad}: {err}");
        }
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}(cn=a){}", "(!".repeat(40), ")".repeat(40));
        assert!(compile_filter(&deep).is_err());
    }

    #[test]
    fn test_decompile() {
        for f in [
            "(cn=John Doe)",
            "(objectClass=*)",
            "(cn=Jo*h*n)",
            "(cn=*x*)",
            "(&(uid=a)(|(sn>=b)(!(mail~=c))))",
            "(cn:dn:1.2.3:=v)",
            r"(cn=a\2ab)",
        ] {
            let packet = compile_filter(f).unwrap();
            assert_eq!(decompile_filter(&packet).unwrap(), f);
        }
    }
}
