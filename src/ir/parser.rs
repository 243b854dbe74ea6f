/// Parser for the textual IR form produced by `printer`
use super::{FlagBehavior, GlobalInit, IRFunction, IRGlobal, IRInstruction, IRModule, Linkage};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

type ParseResult<T> = Result<T, ParseError>;

/// Token cursor over a single line.
struct Cursor<'a> {
    rest: &'a str,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str, line: usize) -> Self {
        Self { rest: text.trim(), line }
    }

    fn error<T>(&self, message: impl Into<String>) -> ParseResult<T> {
        Err(ParseError { line: self.line, message: message.into() })
    }

    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn is_empty(&self) -> bool {
        self.rest.trim().is_empty()
    }

    fn eat(&mut self, literal: &str) -> bool {
        self.skip_ws();
        if let Some(rest) = self.rest.strip_prefix(literal) {
            self.rest = rest;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, literal: &str) -> ParseResult<()> {
        if self.eat(literal) {
            Ok(())
        } else {
            self.error(format!("expected '{}' before '{}'", literal, self.rest))
        }
    }

    fn word(&mut self) -> ParseResult<&'a str> {
        self.skip_ws();
        let end = self
            .rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$' | '-')))
            .unwrap_or(self.rest.len());
        if end == 0 {
            return self.error(format!("expected a word before '{}'", self.rest));
        }
        let (word, rest) = self.rest.split_at(end);
        self.rest = rest;
        Ok(word)
    }

    fn symbol(&mut self) -> ParseResult<String> {
        self.expect("@")?;
        Ok(self.word()?.to_string())
    }

    fn label(&mut self) -> ParseResult<u32> {
        self.expect("L")?;
        let digits = self.word()?;
        digits.parse().or_else(|_| self.error(format!("invalid label 'L{}'", digits)))
    }

    fn integer<T: std::str::FromStr>(&mut self) -> ParseResult<T> {
        let word = self.word()?;
        word.parse().or_else(|_| self.error(format!("invalid integer '{}'", word)))
    }

    fn string(&mut self) -> ParseResult<Vec<u8>> {
        self.expect("\"")?;
        let text = self.rest;
        let mut bytes = Vec::new();
        let mut chars = text.char_indices();
        while let Some((index, c)) = chars.next() {
            match c {
                '"' => {
                    self.rest = &text[index + 1..];
                    return Ok(bytes);
                }
                '\\' => {
                    let hex: String = chars.by_ref().take(2).map(|(_, c)| c).collect();
                    match u8::from_str_radix(&hex, 16) {
                        Ok(byte) if hex.len() == 2 => bytes.push(byte),
                        _ => return self.error(format!("invalid escape '\\{}'", hex)),
                    }
                }
                c => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        self.error("unterminated string")
    }

    fn utf8_string(&mut self) -> ParseResult<String> {
        let bytes = self.string()?;
        String::from_utf8(bytes).or_else(|_| self.error("string is not valid UTF-8"))
    }

    fn linkage(&mut self) -> ParseResult<Linkage> {
        match self.word()? {
            "external" => Ok(Linkage::External),
            "internal" => Ok(Linkage::Internal),
            other => self.error(format!("unknown linkage '{}'", other)),
        }
    }

    fn finish(&self) -> ParseResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            self.error(format!("unexpected trailing text '{}'", self.rest.trim()))
        }
    }
}

/// Parse a module from its textual form.
pub fn parse_module(text: &str) -> Result<IRModule, ParseError> {
    let mut module = IRModule::default();
    let mut current: Option<IRFunction> = None;

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();

        if let Some(function) = current.as_mut() {
            if trimmed == "}" {
                if let Some(function) = current.take() {
                    module.add_function(function);
                }
            } else if !trimmed.is_empty() {
                function.add_instruction(parse_instruction(&mut Cursor::new(trimmed, line))?);
            }
            continue;
        }

        if let Some(comment) = trimmed.strip_prefix(';') {
            if let Some(name) = comment.trim().strip_prefix("ModuleID = '").and_then(|s| s.strip_suffix('\'')) {
                module.name = name.to_string();
            }
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }

        let mut cursor = Cursor::new(trimmed, line);
        let keyword = if cursor.eat("@") {
            "@"
        } else {
            cursor.eat("!");
            cursor.word()?
        };
        match keyword {
            "source_filename" => {
                cursor.expect("=")?;
                module.name = cursor.utf8_string()?;
            }
            "target" => {
                let field = cursor.word()?;
                cursor.expect("=")?;
                let value = cursor.utf8_string()?;
                match field {
                    "triple" => module.target_triple = value,
                    "datalayout" => module.data_layout = value,
                    other => return cursor.error(format!("unknown target field '{}'", other)),
                }
            }
            "meta" => {
                let key = cursor.utf8_string()?;
                cursor.expect("=")?;
                let value = cursor.utf8_string()?;
                module.metadata.insert(key, value);
            }
            "flag" => {
                let behavior = cursor.word()?;
                let behavior = match FlagBehavior::parse(behavior) {
                    Some(behavior) => behavior,
                    None => return cursor.error(format!("unknown flag behavior '{}'", behavior)),
                };
                let key = cursor.utf8_string()?;
                cursor.expect("=")?;
                let value = cursor.integer()?;
                module.add_flag(behavior, &key, value);
            }
            "@" => module.add_global(parse_global(&mut cursor)?),
            "declare" => {
                let linkage = cursor.linkage()?;
                let name = cursor.symbol()?;
                cursor.expect("(")?;
                let params = cursor.integer()?;
                cursor.expect(")")?;
                module.add_function(IRFunction::declare(&name, params).with_linkage(linkage));
            }
            "define" => {
                let linkage = cursor.linkage()?;
                let name = cursor.symbol()?;
                cursor.expect("(")?;
                let params = cursor.integer()?;
                cursor.expect(")")?;
                cursor.expect("locals")?;
                let locals = cursor.integer()?;
                cursor.expect("{")?;
                current = Some(IRFunction::new(&name, params).with_locals(locals).with_linkage(linkage));
            }
            "ctor" | "dtor" => {
                let priority = cursor.integer()?;
                let function = cursor.symbol()?;
                if keyword == "ctor" {
                    module.add_ctor(priority, &function);
                } else {
                    module.add_dtor(priority, &function);
                }
            }
            other => return cursor.error(format!("unexpected '{}'", other)),
        }
        cursor.finish()?;
    }

    if let Some(function) = current {
        return Err(ParseError {
            line: text.lines().count(),
            message: format!("missing '}}' after @{}", function.name),
        });
    }
    Ok(module)
}

fn parse_global(cursor: &mut Cursor<'_>) -> ParseResult<IRGlobal> {
    let name = cursor.word()?.to_string();
    cursor.expect("=")?;
    let linkage = cursor.linkage()?;
    let constant = match cursor.word()? {
        "constant" => true,
        "global" => false,
        other => return cursor.error(format!("expected 'global' or 'constant', found '{}'", other)),
    };
    let init = match cursor.word()? {
        "zero" => GlobalInit::Zero(cursor.integer()?),
        "word" => GlobalInit::Word(cursor.integer()?),
        "bytes" => GlobalInit::Bytes(cursor.string()?),
        "ptrs" => {
            cursor.expect("[")?;
            let mut targets = Vec::new();
            if !cursor.eat("]") {
                loop {
                    targets.push(cursor.symbol()?);
                    if cursor.eat("]") {
                        break;
                    }
                    cursor.expect(",")?;
                }
            }
            GlobalInit::Pointers(targets)
        }
        other => return cursor.error(format!("unknown initializer '{}'", other)),
    };
    cursor.expect(",")?;
    cursor.expect("align")?;
    let align = cursor.integer()?;

    Ok(IRGlobal { name, linkage, constant, align, init })
}

fn parse_instruction(cursor: &mut Cursor<'_>) -> ParseResult<IRInstruction> {
    use IRInstruction::*;

    if cursor.rest.ends_with(':') {
        let label = cursor.label()?;
        cursor.expect(":")?;
        cursor.finish()?;
        return Ok(Label(label));
    }

    let mnemonic = cursor.word()?;
    let inst = match mnemonic {
        "push" => Push(cursor.integer()?),
        "drop" => Drop,
        "dup" => Dup,
        "add" => Add,
        "sub" => Sub,
        "mul" => Mul,
        "div" => Div,
        "rem" => Rem,
        "eq" => Equal,
        "ne" => NotEqual,
        "lt" => Less,
        "gt" => Greater,
        "le" => LessEqual,
        "ge" => GreaterEqual,
        "not" => Not,
        "jmp" => Jump(cursor.label()?),
        "jz" => JumpIfZero(cursor.label()?),
        "param" => LoadParam(cursor.integer()?),
        "local.get" => LoadLocal(cursor.integer()?),
        "local.set" => StoreLocal(cursor.integer()?),
        "global.addr" => GlobalAddress(cursor.symbol()?),
        "load" => Load,
        "store" => Store,
        "call" => {
            let name = cursor.symbol()?;
            Call(name, cursor.integer()?)
        }
        "call.indirect" => CallIndirect(cursor.integer()?),
        "ret" => Return,
        other => return cursor.error(format!("unknown instruction '{}'", other)),
    };
    cursor.finish()?;
    Ok(inst)
}
