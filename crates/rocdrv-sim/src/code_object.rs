//! Parser for the simulated backend's code objects.
//!
//! The simulator understands a PTX-flavoured text format. Only the declarations
//! matter: kernel entry points with their parameter layout, static shared memory,
//! `.maxntid`/`.maxnreg` launch bounds and module-scope `.global`/`.const`
//! variables. Instruction bodies are skipped; kernel behaviour comes from host
//! closures registered by entry name.
//!
//! ```text
//! .version 7.0
//! .global .align 4 .u32 counter;
//! .visible .entry identity(
//!     .param .u64 input,
//!     .param .u64 output,
//!     .param .u32 n
//! )
//! .maxntid 256, 1, 1
//! {
//!     .shared .align 4 .b8 tile[1024];
//! }
//! ```

use std::fmt;

/// One kernel parameter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamInfo {
    pub size: usize,
    pub align: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub params: Vec<ParamInfo>,
    pub static_shared_bytes: usize,
    /// Product of the `.maxntid` dimensions.
    pub max_threads: Option<u32>,
    pub max_registers: Option<u32>,
}

impl EntryInfo {
    /// Byte layout of the packed argument buffer: offset of every parameter
    /// and the total size.
    pub fn packed_layout(&self) -> (Vec<usize>, usize) {
        let mut offsets = Vec::with_capacity(self.params.len());
        let mut offset = 0usize;
        for param in &self.params {
            offset = align_up(offset, param.align.max(1));
            offsets.push(offset);
            offset += param.size;
        }
        (offsets, offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalInfo {
    pub name: String,
    pub size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeObject {
    /// `.version` as major*10+minor, 0 when absent.
    pub version: i32,
    pub entries: Vec<EntryInfo>,
    pub globals: Vec<GlobalInfo>,
}

impl CodeObject {
    pub fn entry(&self, name: &str) -> Option<&EntryInfo> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&GlobalInfo> {
        self.globals.iter().find(|g| g.name == name)
    }
}

/// Loader diagnostic, reported through the JIT error log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    text: String,
    line: usize,
}

fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (idx, raw_line) in source.lines().enumerate() {
        let line = raw_line.split("//").next().unwrap_or("");
        let mut current = String::new();
        for ch in line.chars() {
            if ch.is_alphanumeric() || matches!(ch, '.' | '_' | '$' | '%') {
                current.push(ch);
                continue;
            }
            if !current.is_empty() {
                tokens.push(Token { text: std::mem::take(&mut current), line: idx + 1 });
            }
            if matches!(ch, '(' | ')' | '{' | '}' | '[' | ']' | ',' | ';' | '=') {
                tokens.push(Token { text: ch.to_string(), line: idx + 1 });
            }
        }
        if !current.is_empty() {
            tokens.push(Token { text: current, line: idx + 1 });
        }
    }
    tokens
}

fn type_size(ty: &str) -> Option<usize> {
    match ty {
        ".u8" | ".s8" | ".b8" | ".pred" => Some(1),
        ".u16" | ".s16" | ".b16" | ".f16" => Some(2),
        ".u32" | ".s32" | ".b32" | ".f32" => Some(4),
        ".u64" | ".s64" | ".b64" | ".f64" => Some(8),
        _ => None,
    }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

/// A `.param`/`.shared`/`.global` variable declaration.
struct VarDecl {
    name: String,
    size: usize,
    align: usize,
}

impl Parser {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(|t| t.text.as_str())
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(0)
    }

    fn next(&mut self) -> Option<String> {
        let tok = self.tokens.get(self.pos).map(|t| t.text.clone());
        self.pos += 1;
        tok
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T, ParseError> {
        Err(ParseError { line: self.line(), message: message.into() })
    }

    fn expect(&mut self, want: &str) -> Result<(), ParseError> {
        match self.peek() {
            Some(tok) if tok == want => {
                self.pos += 1;
                Ok(())
            }
            Some(tok) => {
                let tok = tok.to_string();
                self.error(format!("expected '{want}', found '{tok}'"))
            }
            None => self.error(format!("expected '{want}', found end of input")),
        }
    }

    fn number(&mut self) -> Result<u64, ParseError> {
        let tok = self.next().unwrap_or_default();
        let parsed = match tok.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => tok.parse().ok(),
        };
        match parsed {
            Some(n) => Ok(n),
            None => {
                self.pos -= 1;
                self.error(format!("expected a number, found '{tok}'"))
            }
        }
    }

    /// Parses a declaration up to (not including) one of `terminators`.
    fn var_decl(&mut self, terminators: &[&str]) -> Result<VarDecl, ParseError> {
        let mut elem_size = None;
        let mut align = None;
        let mut name = None;
        let mut count = 1usize;
        let start_line = self.line();

        while let Some(tok) = self.peek() {
            if terminators.contains(&tok) {
                break;
            }
            let tok = tok.to_string();
            if tok == ".align" {
                self.pos += 1;
                align = Some(self.number()? as usize);
            } else if let Some(size) = type_size(&tok) {
                self.pos += 1;
                elem_size = Some(size);
            } else if tok == "[" {
                self.pos += 1;
                if self.peek() == Some("]") {
                    // Unsized extern arrays contribute nothing statically.
                    count = 0;
                } else {
                    count *= self.number()? as usize;
                }
                self.expect("]")?;
            } else if tok == "=" {
                // Skip initializers; memory starts zeroed.
                while let Some(t) = self.peek() {
                    if terminators.contains(&t) {
                        break;
                    }
                    self.pos += 1;
                }
            } else if tok.starts_with('.') {
                // State space or qualifier (.param, .shared, .extern, .ptr, ...)
                self.pos += 1;
            } else if name.is_none() {
                self.pos += 1;
                name = Some(tok);
            } else {
                return self.error(format!("unexpected token '{tok}' in declaration"));
            }
        }

        let Some(elem_size) = elem_size else {
            return Err(ParseError { line: start_line, message: "declaration without a type".into() });
        };
        let Some(name) = name else {
            return Err(ParseError { line: start_line, message: "declaration without a name".into() });
        };
        Ok(VarDecl {
            name,
            size: elem_size * count,
            align: align.unwrap_or(elem_size),
        })
    }

    fn entry(&mut self) -> Result<EntryInfo, ParseError> {
        let Some(name) = self.next() else {
            return self.error("expected an entry name");
        };
        if name.starts_with('.') || name == "(" {
            self.pos -= 1;
            return self.error(format!("invalid entry name '{name}'"));
        }

        let mut params = Vec::new();
        if self.peek() == Some("(") {
            self.pos += 1;
            while self.peek() != Some(")") {
                if self.peek().is_none() {
                    return self.error(format!("unterminated parameter list for '{name}'"));
                }
                let decl = self.var_decl(&[",", ")"])?;
                params.push(ParamInfo { size: decl.size, align: decl.align });
                if self.peek() == Some(",") {
                    self.pos += 1;
                }
            }
            self.expect(")")?;
        }

        let mut max_threads = None;
        let mut max_registers = None;
        loop {
            match self.peek() {
                Some(".maxntid") => {
                    self.pos += 1;
                    let mut product = self.number()? as u32;
                    while self.peek() == Some(",") {
                        self.pos += 1;
                        product = product.saturating_mul(self.number()? as u32);
                    }
                    max_threads = Some(product);
                }
                Some(".maxnreg") => {
                    self.pos += 1;
                    max_registers = Some(self.number()? as u32);
                }
                Some("{") | Some(";") | None => break,
                Some(_) => self.pos += 1,
            }
        }

        let mut static_shared_bytes = 0usize;
        if self.peek() == Some("{") {
            self.pos += 1;
            let mut depth = 1usize;
            while depth > 0 {
                match self.peek() {
                    None => return self.error(format!("unterminated body for '{name}'")),
                    Some("{") => {
                        depth += 1;
                        self.pos += 1;
                    }
                    Some("}") => {
                        depth -= 1;
                        self.pos += 1;
                    }
                    Some(".shared") => {
                        self.pos += 1;
                        let decl = self.var_decl(&[";"])?;
                        static_shared_bytes = align_up(static_shared_bytes, decl.align.max(1)) + decl.size;
                    }
                    Some(_) => self.pos += 1,
                }
            }
        } else if self.peek() == Some(";") {
            self.pos += 1;
        }

        Ok(EntryInfo {
            name,
            params,
            static_shared_bytes,
            max_threads,
            max_registers,
        })
    }
}

/// Parses a code object. Images must be UTF-8 text with at least one entry.
pub fn parse(image: &[u8]) -> Result<CodeObject, ParseError> {
    let end = image.iter().position(|&b| b == 0).unwrap_or(image.len());
    let text = std::str::from_utf8(&image[..end]).map_err(|e| ParseError {
        line: 0,
        message: format!("code object is not valid text: {e}"),
    })?;

    let mut parser = Parser { tokens: tokenize(text), pos: 0 };
    let mut object = CodeObject::default();

    while let Some(tok) = parser.peek() {
        match tok {
            ".version" => {
                parser.pos += 1;
                let version = parser.next().unwrap_or_default();
                let mut parts = version.splitn(2, '.');
                let major: i32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
                let minor: i32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
                object.version = major * 10 + minor;
            }
            ".entry" => {
                parser.pos += 1;
                let entry = parser.entry()?;
                if object.entry(&entry.name).is_some() {
                    return parser.error(format!("duplicate entry '{}'", entry.name));
                }
                object.entries.push(entry);
            }
            ".global" | ".const" => {
                parser.pos += 1;
                let decl = parser.var_decl(&[";"])?;
                parser.expect(";")?;
                object.globals.push(GlobalInfo { name: decl.name, size: decl.size });
            }
            _ => parser.pos += 1,
        }
    }

    if object.entries.is_empty() {
        return Err(ParseError {
            line: 0,
            message: "code object declares no .entry".to_string(),
        });
    }
    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
        .version 7.0
        .target sim
        .global .align 4 .u32 counter;
        .global .align 8 .b8 table[256] = { 0 };

        // copies n words
        .visible .entry identity(
            .param .u64 input,
            .param .u64 output,
            .param .u32 n
        )
        .maxntid 256, 1, 1
        .maxnreg 32
        {
            .shared .align 4 .b8 tile[1024];
            .shared .u32 flag;
            ret;
        }

        .entry empty()
        {
        }
    "#;

    #[test]
    fn parses_entries_and_globals() {
        let object = parse(SOURCE.as_bytes()).expect("parses");
        assert_eq!(object.version, 70);
        assert_eq!(object.entries.len(), 2);

        let identity = object.entry("identity").expect("identity entry");
        assert_eq!(identity.params.len(), 3);
        assert_eq!(identity.params[2], ParamInfo { size: 4, align: 4 });
        assert_eq!(identity.static_shared_bytes, 1028);
        assert_eq!(identity.max_threads, Some(256));
        assert_eq!(identity.max_registers, Some(32));

        assert!(object.entry("empty").expect("empty entry").params.is_empty());
        assert_eq!(object.global("counter").map(|g| g.size), Some(4));
        assert_eq!(object.global("table").map(|g| g.size), Some(256));
    }

    #[test]
    fn packed_layout_uses_natural_alignment() {
        let entry = EntryInfo {
            name: "k".into(),
            params: vec![
                ParamInfo { size: 4, align: 4 },
                ParamInfo { size: 8, align: 8 },
                ParamInfo { size: 1, align: 1 },
            ],
            static_shared_bytes: 0,
            max_threads: None,
            max_registers: None,
        };
        assert_eq!(entry.packed_layout(), (vec![0, 8, 16], 17));
    }

    #[test]
    fn rejects_images_without_entries() {
        let err = parse(b".version 7.0\n.global .u32 x;\n").expect_err("no entry");
        assert!(err.message.contains("no .entry"));
        assert!(parse(&[0xff, 0xfe, 0x00]).is_err());
    }

    #[test]
    fn reports_line_of_malformed_param() {
        let err = parse(b".entry k(\n .param input\n)\n{\n}\n").expect_err("untyped param");
        assert_eq!(err.line, 2);
    }

    #[test]
    fn trailing_nul_is_ignored() {
        let mut image = b".entry k() {}".to_vec();
        image.push(0);
        assert!(parse(&image).is_ok());
    }
}
