//! Recursive-descent parser building a `Module` from IL text (§4.C).

use std::str::FromStr;

use thiserror::Error;
use viper_ir::{BasicBlock, BlockParam, Extern, Function, Global, Instruction, Module, Opcode, Parameter, Type, Value};
use viper_support::SourceLoc;

use crate::lexer::{tokenize, Token};

#[derive(Debug, Clone, PartialEq, Error)]
#[error("parse error at {loc}: {message}")]
pub struct ParseError {
    pub message: String,
    pub loc: SourceLoc,
}

impl ParseError {
    fn at(line: u32, column: u32, message: impl Into<String>) -> Self {
        ParseError { message: message.into(), loc: SourceLoc::new(0, line, column) }
    }
}

struct Cursor<'a> {
    toks: &'a [(Token, u32)],
    pos: usize,
    line: u32,
}

impl<'a> Cursor<'a> {
    fn new(toks: &'a [(Token, u32)], line: u32) -> Self {
        Cursor { toks, pos: 0, line }
    }

    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.pos).map(|(t, _)| t)
    }

    fn col(&self) -> u32 {
        self.toks.get(self.pos).map(|(_, c)| *c).unwrap_or(0)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t.map(|(t, _)| t)
    }

    fn err(&self, message: impl Into<String>) -> ParseError {
        ParseError::at(self.line, self.col(), message)
    }

    fn eat(&mut self, expected: &Token) -> Result<(), ParseError> {
        match self.peek() {
            Some(t) if t == expected => {
                self.pos += 1;
                Ok(())
            }
            other => Err(self.err(format!("expected {:?}, found {:?}", expected, other))),
        }
    }

    fn eat_comma_if_present(&mut self) -> bool {
        if self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            true
        } else {
            false
        }
    }
}

fn is_value_start(tok: &Token) -> bool {
    matches!(
        tok,
        Token::Percent(_)
            | Token::Int(_)
            | Token::Float(_)
            | Token::True
            | Token::False
            | Token::NaN
            | Token::Inf
            | Token::NegInf
            | Token::Str(_)
            | Token::At(_)
            | Token::Null
    )
}

fn token_to_value(tok: Token, cursor: &Cursor) -> Result<Value, ParseError> {
    match tok {
        Token::Percent(name) => {
            if let Some(rest) = name.strip_prefix('t') {
                if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                    return Ok(Value::Temp(rest.parse().unwrap()));
                }
            }
            Err(cursor.err(format!("expected temp operand '%tN', found '%{}'", name)))
        }
        Token::Int(v) => Ok(Value::ConstInt(v, false)),
        Token::True => Ok(Value::ConstInt(1, true)),
        Token::False => Ok(Value::ConstInt(0, true)),
        Token::Float(v) => Ok(Value::ConstFloat(v)),
        Token::NaN => Ok(Value::ConstFloat(f64::NAN)),
        Token::Inf => Ok(Value::ConstFloat(f64::INFINITY)),
        Token::NegInf => Ok(Value::ConstFloat(f64::NEG_INFINITY)),
        Token::Str(bytes) => Ok(Value::ConstStr(bytes)),
        Token::At(name) => Ok(Value::GlobalAddr(name)),
        Token::Null => Ok(Value::NullPtr),
        other => Err(cursor.err(format!("expected a value, found {:?}", other))),
    }
}

fn parse_type(cursor: &mut Cursor) -> Result<Type, ParseError> {
    match cursor.next() {
        Some(Token::Ident(name)) => Type::from_str(&name).map_err(|e| cursor.err(e)),
        other => Err(cursor.err(format!("expected a type name, found {:?}", other))),
    }
}

/// Parses a `%name:type` pair (used by function and block parameter lists).
fn parse_named_typed(cursor: &mut Cursor) -> Result<(String, Type), ParseError> {
    let name = match cursor.next() {
        Some(Token::Percent(name)) => name,
        other => return Err(cursor.err(format!("expected '%name', found {:?}", other))),
    };
    cursor.eat(&Token::Colon)?;
    let ty = parse_type(cursor)?;
    Ok((name, ty))
}

fn parse_args(cursor: &mut Cursor) -> Result<Vec<Value>, ParseError> {
    let mut args = Vec::new();
    if cursor.peek() != Some(&Token::LParen) {
        return Ok(args);
    }
    cursor.next();
    if cursor.peek() != Some(&Token::RParen) {
        loop {
            let tok = cursor.next().ok_or_else(|| cursor.err("unexpected end of operand list"))?;
            args.push(token_to_value(tok, cursor)?);
            if !cursor.eat_comma_if_present() {
                break;
            }
        }
    }
    cursor.eat(&Token::RParen)?;
    Ok(args)
}

/// Parses one instruction line's tokens into an `Instruction` (§3, §4.C).
pub fn parse_instruction(toks: &[(Token, u32)], line: u32) -> Result<Instruction, ParseError> {
    let mut cursor = Cursor::new(toks, line);

    let mut result = None;
    if let (Some(Token::Percent(_)), Some(Token::Colon)) = (toks.first().map(|(t, _)| t), toks.get(1).map(|(t, _)| t)) {
        let (name, ty) = parse_named_typed(&mut cursor)?;
        let id = name.strip_prefix('t').and_then(|d| d.parse().ok())
            .ok_or_else(|| cursor.err(format!("expected result temp '%tN', found '%{}'", name)))?;
        cursor.eat(&Token::Eq)?;
        result = Some((id, ty));
    }

    let opcode_name = match cursor.next() {
        Some(Token::Ident(name)) => name,
        other => return Err(cursor.err(format!("expected an opcode, found {:?}", other))),
    };
    let opcode = Opcode::from_name(&opcode_name).ok_or_else(|| cursor.err(format!("unknown opcode '{}'", opcode_name)))?;

    let mut instr = Instruction::new(opcode);
    instr.result = result;

    if opcode == Opcode::Call {
        match cursor.next() {
            Some(Token::At(name)) => instr.callee = Some(name),
            other => return Err(cursor.err(format!("expected '@callee' after 'call', found {:?}", other))),
        }
    }

    while let Some(tok) = cursor.peek() {
        if !is_value_start(tok) {
            break;
        }
        let tok = cursor.next().unwrap();
        instr.operands.push(token_to_value(tok, &cursor)?);
        if !cursor.eat_comma_if_present() {
            break;
        }
    }

    let is_switch = opcode == Opcode::SwitchI32;
    if let Some(Token::Ident(_)) = cursor.peek() {
        let label = match cursor.next() {
            Some(Token::Ident(name)) => name,
            _ => unreachable!(),
        };
        let args = parse_args(&mut cursor)?;
        instr.labels.push(label);
        instr.branch_args.push(args);

        loop {
            if is_switch {
                if cursor.peek() != Some(&Token::Comma) {
                    break;
                }
                cursor.next();
                cursor.eat(&Token::Case)?;
                let case_val = match cursor.next() {
                    Some(Token::Int(v)) => v as i32,
                    other => return Err(cursor.err(format!("expected a case value, found {:?}", other))),
                };
                cursor.eat(&Token::Arrow)?;
                let label = match cursor.next() {
                    Some(Token::Ident(name)) => name,
                    other => return Err(cursor.err(format!("expected a case label, found {:?}", other))),
                };
                let args = parse_args(&mut cursor)?;
                instr.cases.push(case_val);
                instr.labels.push(label);
                instr.branch_args.push(args);
            } else {
                match cursor.peek() {
                    Some(Token::Ident(_)) => {
                        let label = match cursor.next() {
                            Some(Token::Ident(name)) => name,
                            _ => unreachable!(),
                        };
                        let args = parse_args(&mut cursor)?;
                        instr.labels.push(label);
                        instr.branch_args.push(args);
                    }
                    _ => break,
                }
            }
        }
    }

    if cursor.pos != toks.len() {
        return Err(cursor.err("unexpected trailing tokens"));
    }

    Ok(instr)
}

fn tokenize_line(text: &str, line: u32) -> Result<Vec<(Token, u32)>, ParseError> {
    tokenize(text).map_err(|e| ParseError::at(line, e.column, e.message))
}

fn parse_param_list(cursor: &mut Cursor) -> Result<Vec<(String, Type)>, ParseError> {
    cursor.eat(&Token::LParen)?;
    let mut params = Vec::new();
    if cursor.peek() != Some(&Token::RParen) {
        loop {
            params.push(parse_named_typed(cursor)?);
            if !cursor.eat_comma_if_present() {
                break;
            }
        }
    }
    cursor.eat(&Token::RParen)?;
    Ok(params)
}

fn parse_extern_line(text: &str, line: u32) -> Result<Extern, ParseError> {
    let rest = text.strip_prefix("extern ").unwrap();
    let toks = tokenize_line(rest, line)?;
    let mut cursor = Cursor::new(&toks, line);
    let name = match cursor.next() {
        Some(Token::At(name)) => name,
        other => return Err(cursor.err(format!("expected '@name', found {:?}", other))),
    };
    cursor.eat(&Token::LParen)?;
    let mut param_types = Vec::new();
    if cursor.peek() != Some(&Token::RParen) {
        loop {
            param_types.push(parse_type(&mut cursor)?);
            if !cursor.eat_comma_if_present() {
                break;
            }
        }
    }
    cursor.eat(&Token::RParen)?;
    cursor.eat(&Token::Arrow)?;
    let return_type = parse_type(&mut cursor)?;
    Ok(Extern::new(name, return_type, param_types))
}

fn parse_global_line(text: &str, line: u32) -> Result<Global, ParseError> {
    let rest = text.strip_prefix("global const str ").ok_or_else(|| ParseError::at(line, 1, "malformed global declaration"))?;
    let toks = tokenize_line(rest, line)?;
    let mut cursor = Cursor::new(&toks, line);
    let name = match cursor.next() {
        Some(Token::At(name)) => name,
        other => return Err(cursor.err(format!("expected '@name', found {:?}", other))),
    };
    cursor.eat(&Token::Eq)?;
    let data = match cursor.next() {
        Some(Token::Str(bytes)) => String::from_utf8(bytes).map_err(|_| cursor.err("global string data is not valid UTF-8"))?,
        other => return Err(cursor.err(format!("expected a quoted string, found {:?}", other))),
    };
    Ok(Global::new(name, data))
}

struct FunctionHeader {
    name: String,
    params: Vec<(String, Type)>,
    return_type: Type,
}

fn parse_function_header(text: &str, line: u32) -> Result<FunctionHeader, ParseError> {
    let rest = text.strip_prefix("func ").unwrap();
    let toks = tokenize_line(rest, line)?;
    let mut cursor = Cursor::new(&toks, line);
    let name = match cursor.next() {
        Some(Token::At(name)) => name,
        other => return Err(cursor.err(format!("expected '@name', found {:?}", other))),
    };
    let params = parse_param_list(&mut cursor)?;
    cursor.eat(&Token::Arrow)?;
    let return_type = parse_type(&mut cursor)?;
    cursor.eat(&Token::LBrace)?;
    Ok(FunctionHeader { name, params, return_type })
}

/// True when `text` (already trimmed, non-empty, not `}`) is a block
/// header rather than an instruction: its leading identifier, once any
/// `%tN:ty = ` result prefix is skipped, is not a known opcode name.
fn looks_like_block_header(text: &str, line: u32) -> Result<bool, ParseError> {
    let toks = tokenize_line(text, line)?;
    let first_ident = match toks.first().map(|(t, _)| t) {
        Some(Token::Ident(name)) => Some(name.clone()),
        _ => None,
    };
    match first_ident {
        Some(name) => Ok(Opcode::from_name(&name).is_none()),
        None => Ok(false),
    }
}

fn parse_block(label_line: &str, line: u32, body: &[(String, u32)]) -> Result<BasicBlock, ParseError> {
    let header = label_line.strip_suffix("):").ok_or_else(|| ParseError::at(line, 1, "block header must end with '):'"))?;
    let open = header.find('(').ok_or_else(|| ParseError::at(line, 1, "block header missing '('"))?;
    let (label, param_text) = header.split_at(open);
    let param_text = &param_text[1..];
    let mut block = BasicBlock::new(label);
    if !param_text.trim().is_empty() {
        let toks = tokenize_line(param_text, line)?;
        let mut cursor = Cursor::new(&toks, line);
        let mut next_temp = 0u32;
        loop {
            let (name, ty) = parse_named_typed(&mut cursor)?;
            // The text format records block parameters by human-readable
            // name only (§4.C); it does not serialize the numeric temp id
            // a parameter is bound to, so re-parsed modules renumber
            // block parameters positionally. This only affects debug
            // presentation, not verifier or VM semantics, which key off
            // the instruction stream's own `%tN` operands.
            block.params.push(BlockParam { name, ty, temp: next_temp });
            next_temp += 1;
            if !cursor.eat_comma_if_present() {
                break;
            }
        }
    }
    for (text, lineno) in body {
        let toks = tokenize_line(text, *lineno)?;
        block.push(parse_instruction(&toks, *lineno)?);
    }
    Ok(block)
}

/// Parses a complete module from IL text (§4.C). Lines are processed
/// top to bottom; extern/global declarations may appear in any order
/// before the functions that use them.
pub fn parse_module(source: &str) -> Result<Module, ParseError> {
    let lines: Vec<(u32, &str)> = source.lines().enumerate().map(|(i, l)| (i as u32 + 1, l)).collect();
    let mut module = Module::new();
    let mut i = 0usize;

    while i < lines.len() && lines[i].1.trim().is_empty() {
        i += 1;
    }
    if i >= lines.len() {
        return Err(ParseError::at(1, 1, "empty module"));
    }
    let (header_line, header_text) = lines[i];
    if header_text.trim() != "il 0.1.0" {
        return Err(ParseError::at(header_line, 1, "module must start with 'il 0.1.0'"));
    }
    i += 1;

    while i < lines.len() {
        let (lineno, raw) = lines[i];
        let text = raw.trim();
        if text.is_empty() {
            i += 1;
            continue;
        }
        if let Some(ext) = text.strip_prefix("extern ").map(|_| text) {
            module.add_extern(parse_extern_line(ext, lineno)?);
            i += 1;
        } else if text.starts_with("global ") {
            module.add_global(parse_global_line(text, lineno)?);
            i += 1;
        } else if text.starts_with("func ") {
            let header = parse_function_header(text, lineno)?;
            i += 1;

            let mut temp = 0u32;
            let params: Vec<Parameter> = header
                .params
                .into_iter()
                .map(|(name, ty)| {
                    let p = Parameter::new(name, ty, temp);
                    temp += 1;
                    p
                })
                .collect();
            let mut func = Function::new(header.name, header.return_type, params);
            func.blocks.clear();

            let mut blocks = Vec::new();
            let mut current_label: Option<(String, u32)> = None;
            let mut current_body: Vec<(String, u32)> = Vec::new();

            loop {
                if i >= lines.len() {
                    return Err(ParseError::at(lineno, 1, "unterminated function body"));
                }
                let (bline, braw) = lines[i];
                let btext = braw.trim();
                if btext == "}" {
                    i += 1;
                    break;
                }
                if btext.is_empty() {
                    i += 1;
                    continue;
                }
                if looks_like_block_header(btext, bline)? {
                    if let Some((label, lline)) = current_label.take() {
                        blocks.push(parse_block(&label, lline, &current_body)?);
                        current_body.clear();
                    }
                    current_label = Some((btext.to_string(), bline));
                } else {
                    let (_, lline) = current_label.clone().ok_or_else(|| ParseError::at(bline, 1, "instruction outside of any block"))?;
                    let _ = lline;
                    current_body.push((btext.to_string(), bline));
                }
                i += 1;
            }
            if let Some((label, lline)) = current_label.take() {
                blocks.push(parse_block(&label, lline, &current_body)?);
            }
            func.blocks = blocks;
            module.add_function(func);
        } else {
            return Err(ParseError::at(lineno, 1, format!("expected 'extern', 'global', or 'func', found '{}'", text)));
        }
    }

    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_ir::Value;

    #[test]
    fn parses_extern_and_global() {
        let m = parse_module("il 0.1.0\nextern @rt_len(ptr) -> i64\nglobal const str @s = \"hi\"\n").unwrap();
        assert_eq!(m.externs.len(), 1);
        assert_eq!(m.externs[0].name, "rt_len");
        assert_eq!(m.globals[0].data, "hi");
    }

    #[test]
    fn parses_function_with_two_blocks() {
        let src = "il 0.1.0\n\nfunc @id(%n:i64) -> i64 {\nentry(%n:i64):\n  %t1:i64 = add %t0, 0\n  br exit(%t1)\nexit(%r:i64):\n  ret %r\n}\n";
        let m = parse_module(src).unwrap();
        let f = m.function("id").unwrap();
        assert_eq!(f.blocks.len(), 2);
        assert_eq!(f.blocks[0].label, "entry");
        assert_eq!(f.blocks[1].label, "exit");
        assert_eq!(f.blocks[1].instructions[0].operands, vec![Value::Temp(0)]);
    }

    #[test]
    fn parses_switch_i32_with_multiple_arms() {
        let toks = tokenize_line("switch_i32 %t0 default(), case 1 -> a(), case 2 -> b()", 1).unwrap();
        let instr = parse_instruction(&toks, 1).unwrap();
        assert_eq!(instr.labels, vec!["default", "a", "b"]);
        assert_eq!(instr.cases, vec![1, 2]);
    }

    #[test]
    fn parses_cbr_with_branch_args() {
        let toks = tokenize_line("cbr %t0 truelbl(%t1) falselbl(%t2)", 1).unwrap();
        let instr = parse_instruction(&toks, 1).unwrap();
        assert_eq!(instr.labels, vec!["truelbl", "falselbl"]);
        assert_eq!(instr.branch_args[0], vec![Value::Temp(1)]);
        assert_eq!(instr.branch_args[1], vec![Value::Temp(2)]);
    }

    #[test]
    fn rejects_unknown_opcode() {
        let toks = tokenize_line("bogus %t0", 1).unwrap();
        let err = parse_instruction(&toks, 1).unwrap_err();
        assert!(err.message.contains("unknown opcode"));
    }
}
