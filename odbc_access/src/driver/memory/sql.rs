//! Tokenizer and parser for the SQL subset the memory driver understands.

use super::store::{column_type, diag, ColumnDef, SqlResult, Value};
use crate::driver::DiagRecord;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Quoted(String),
    Number(String),
    Str(String),
    Hex(Vec<u8>),
    Param,
    Punct(char),
}

fn syntax(message: impl Into<String>) -> DiagRecord {
    diag("42000", format!("Syntax error: {}", message.into()))
}

fn tokenize(sql: &str) -> SqlResult<Vec<Token>> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if (c == 'x' || c == 'X') && chars.get(i + 1) == Some(&'\'') {
            let (text, next) = quoted(&chars, i + 1, '\'')?;
            if text.len() % 2 != 0 {
                return Err(syntax("odd number of hex digits"));
            }
            let bytes = (0..text.len())
                .step_by(2)
                .map(|k| u8::from_str_radix(&text[k..k + 2], 16))
                .collect::<std::result::Result<Vec<u8>, _>>()
                .map_err(|_| syntax(format!("invalid hex literal X'{}'", text)))?;
            tokens.push(Token::Hex(bytes));
            i = next;
        } else if c.is_ascii_alphabetic() || c == '_' || c == '@' || c == '#' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || "_@#$".contains(chars[i]))
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if c.is_ascii_digit()
            || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit))
        {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_digit()
                    || chars[i] == '.'
                    || chars[i] == 'e'
                    || chars[i] == 'E'
                    || ((chars[i] == '-' || chars[i] == '+')
                        && matches!(chars[i - 1], 'e' | 'E')))
            {
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
        } else if c == '\'' {
            let (text, next) = quoted(&chars, i, '\'')?;
            tokens.push(Token::Str(text));
            i = next;
        } else if c == '"' {
            let (text, next) = quoted(&chars, i, '"')?;
            tokens.push(Token::Quoted(text));
            i = next;
        } else if c == '[' {
            let end = chars[i..]
                .iter()
                .position(|&x| x == ']')
                .ok_or_else(|| syntax("unterminated [identifier]"))?;
            tokens.push(Token::Quoted(chars[i + 1..i + end].iter().collect()));
            i += end + 1;
        } else if c == '?' {
            tokens.push(Token::Param);
            i += 1;
        } else if "(),;*={}.-".contains(c) {
            tokens.push(Token::Punct(c));
            i += 1;
        } else {
            return Err(syntax(format!("unexpected character '{}'", c)));
        }
    }
    Ok(tokens)
}

/// Reads a literal quoted by `q` starting at `start`; a doubled quote
/// escapes itself.
fn quoted(chars: &[char], start: usize, q: char) -> SqlResult<(String, usize)> {
    let mut out = String::new();
    let mut i = start + 1;
    loop {
        match chars.get(i) {
            None => return Err(syntax("unterminated quoted literal")),
            Some(&c) if c == q => {
                if chars.get(i + 1) == Some(&q) {
                    out.push(q);
                    i += 2;
                } else {
                    return Ok((out, i + 1));
                }
            }
            Some(&c) => {
                out.push(c);
                i += 1;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// 0-based ordinal of a `?` marker within the batch.
    Param(usize),
    Literal(Value),
    Column(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Star,
    CountStar(Option<String>),
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateTable {
        name: String,
        columns: Vec<ColumnDef>,
    },
    DropTable {
        name: String,
        if_exists: bool,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Expr>>,
    },
    Select {
        items: Vec<SelectItem>,
        from: Option<String>,
        filter: Option<Filter>,
        order: Option<Order>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Expr)>,
        filter: Option<Filter>,
    },
    Delete {
        table: String,
        filter: Option<Filter>,
    },
    Call {
        name: String,
        ret: Option<usize>,
        args: Vec<Expr>,
    },
}

/// A parsed, `;`-separated batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub commands: Vec<Command>,
    pub param_count: usize,
}

pub fn parse(sql: &str) -> SqlResult<Batch> {
    let mut parser = Parser {
        tokens: tokenize(sql)?,
        pos: 0,
        params: 0,
    };
    let mut commands = Vec::new();
    while !parser.at_end() {
        if parser.eat_punct(';') {
            continue;
        }
        commands.push(parser.command()?);
        if !parser.at_end() && !parser.eat_punct(';') {
            return Err(syntax(format!("unexpected {:?}", parser.peek())));
        }
    }
    if commands.is_empty() {
        return Err(syntax("empty statement"));
    }
    Ok(Batch {
        commands,
        param_count: parser.params,
    })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    params: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(kw))
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.is_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> SqlResult<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(syntax(format!("expected {} near {:?}", kw, self.peek())))
        }
    }

    fn eat_punct(&mut self, p: char) -> bool {
        if self.peek() == Some(&Token::Punct(p)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: char) -> SqlResult<()> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(syntax(format!("expected '{}' near {:?}", p, self.peek())))
        }
    }

    fn identifier(&mut self) -> SqlResult<String> {
        match self.next() {
            Some(Token::Ident(s)) | Some(Token::Quoted(s)) => {
                // Qualified names keep their last part.
                if self.eat_punct('.') {
                    return self.identifier();
                }
                Ok(s)
            }
            other => Err(syntax(format!("expected identifier, found {:?}", other))),
        }
    }

    fn number(&mut self) -> SqlResult<usize> {
        match self.next() {
            Some(Token::Number(n)) => n
                .parse()
                .map_err(|_| syntax(format!("expected integer, found {}", n))),
            other => Err(syntax(format!("expected integer, found {:?}", other))),
        }
    }

    fn command(&mut self) -> SqlResult<Command> {
        if self.eat_punct('{') {
            let call = self.call()?;
            self.expect_punct('}')?;
            return Ok(call);
        }
        match self.peek() {
            Some(Token::Ident(kw)) => match kw.to_ascii_uppercase().as_str() {
                "CREATE" => self.create_table(),
                "DROP" => self.drop_table(),
                "INSERT" => self.insert(),
                "SELECT" => self.select(),
                "UPDATE" => self.update(),
                "DELETE" => self.delete(),
                "CALL" => self.call(),
                other => Err(syntax(format!("unsupported statement {}", other))),
            },
            Some(Token::Param) => self.call(),
            other => Err(syntax(format!("unexpected {:?}", other))),
        }
    }

    fn create_table(&mut self) -> SqlResult<Command> {
        self.expect_keyword("CREATE")?;
        self.expect_keyword("TABLE")?;
        let name = self.identifier()?;
        self.expect_punct('(')?;
        let mut columns: Vec<ColumnDef> = Vec::new();
        loop {
            let table_constraint = ["PRIMARY", "CONSTRAINT", "UNIQUE", "FOREIGN", "CHECK"]
                .iter()
                .any(|kw| self.is_keyword(kw));
            if table_constraint {
                self.skip_definition()?;
            } else {
                let col_name = self.identifier()?;
                let type_name = self.identifier()?;
                let mut args = Vec::new();
                if self.eat_punct('(') {
                    if self.eat_keyword("MAX") {
                        args.push(0);
                    } else {
                        args.push(self.number()?);
                        if self.eat_punct(',') {
                            args.push(self.number()?);
                        }
                    }
                    self.expect_punct(')')?;
                }
                let (mut sql_type, size, digits) = column_type(&type_name, &args)?;
                if args.first() == Some(&0) {
                    // VARCHAR(MAX) and friends behave like the long types.
                    sql_type = match sql_type {
                        crate::protocol::SqlType::Varbinary => {
                            crate::protocol::SqlType::LongVarbinary
                        }
                        crate::protocol::SqlType::WVarchar => {
                            crate::protocol::SqlType::WLongVarchar
                        }
                        _ => crate::protocol::SqlType::LongVarchar,
                    };
                }
                let nullable = self.skip_definition()?;
                columns.push(ColumnDef {
                    name: col_name,
                    sql_type,
                    size: if sql_type.is_long() { 2_147_483_647 } else { size },
                    digits,
                    nullable,
                });
            }
            if self.eat_punct(')') {
                break;
            }
            self.expect_punct(',')?;
        }
        if columns.is_empty() {
            return Err(syntax("table needs at least one column"));
        }
        Ok(Command::CreateTable { name, columns })
    }

    /// Skips the rest of a column or constraint definition. Returns whether
    /// the column may hold NULL.
    fn skip_definition(&mut self) -> SqlResult<bool> {
        let mut depth = 0usize;
        let mut nullable = true;
        let mut previous_not = false;
        loop {
            match self.peek() {
                None => return Err(syntax("unterminated column list")),
                Some(Token::Punct(',')) | Some(Token::Punct(')')) if depth == 0 => {
                    return Ok(nullable)
                }
                Some(Token::Punct('(')) => depth += 1,
                Some(Token::Punct(')')) => depth -= 1,
                Some(Token::Ident(s)) => {
                    let upper = s.to_ascii_uppercase();
                    if (upper == "NULL" && previous_not) || upper == "PRIMARY" {
                        nullable = false;
                    }
                    previous_not = upper == "NOT";
                    self.pos += 1;
                    continue;
                }
                _ => {}
            }
            previous_not = false;
            self.pos += 1;
        }
    }

    fn drop_table(&mut self) -> SqlResult<Command> {
        self.expect_keyword("DROP")?;
        self.expect_keyword("TABLE")?;
        let if_exists = if self.eat_keyword("IF") {
            self.expect_keyword("EXISTS")?;
            true
        } else {
            false
        };
        let name = self.identifier()?;
        Ok(Command::DropTable { name, if_exists })
    }

    fn insert(&mut self) -> SqlResult<Command> {
        self.expect_keyword("INSERT")?;
        self.expect_keyword("INTO")?;
        let table = self.identifier()?;
        let columns = if self.eat_punct('(') {
            let mut cols = vec![self.identifier()?];
            while self.eat_punct(',') {
                cols.push(self.identifier()?);
            }
            self.expect_punct(')')?;
            Some(cols)
        } else {
            None
        };
        self.expect_keyword("VALUES")?;
        let mut rows = Vec::new();
        loop {
            self.expect_punct('(')?;
            let mut row = vec![self.expr()?];
            while self.eat_punct(',') {
                row.push(self.expr()?);
            }
            self.expect_punct(')')?;
            rows.push(row);
            if !self.eat_punct(',') {
                break;
            }
        }
        Ok(Command::Insert {
            table,
            columns,
            rows,
        })
    }

    fn select(&mut self) -> SqlResult<Command> {
        self.expect_keyword("SELECT")?;
        let mut items = Vec::new();
        loop {
            if self.eat_punct('*') {
                items.push(SelectItem::Star);
            } else if self.is_keyword("COUNT") {
                self.pos += 1;
                self.expect_punct('(')?;
                self.expect_punct('*')?;
                self.expect_punct(')')?;
                items.push(SelectItem::CountStar(self.alias()?));
            } else {
                let expr = self.expr()?;
                items.push(SelectItem::Expr {
                    expr,
                    alias: self.alias()?,
                });
            }
            if !self.eat_punct(',') {
                break;
            }
        }
        let from = if self.eat_keyword("FROM") {
            Some(self.identifier()?)
        } else {
            None
        };
        let filter = self.filter()?;
        let order = if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            let column = self.identifier()?;
            let descending = if self.eat_keyword("DESC") {
                true
            } else {
                self.eat_keyword("ASC");
                false
            };
            Some(Order { column, descending })
        } else {
            None
        };
        Ok(Command::Select {
            items,
            from,
            filter,
            order,
        })
    }

    fn alias(&mut self) -> SqlResult<Option<String>> {
        if self.eat_keyword("AS") {
            return self.identifier().map(Some);
        }
        Ok(None)
    }

    fn filter(&mut self) -> SqlResult<Option<Filter>> {
        if !self.eat_keyword("WHERE") {
            return Ok(None);
        }
        let column = self.identifier()?;
        self.expect_punct('=')?;
        let value = self.expr()?;
        Ok(Some(Filter { column, value }))
    }

    fn update(&mut self) -> SqlResult<Command> {
        self.expect_keyword("UPDATE")?;
        let table = self.identifier()?;
        self.expect_keyword("SET")?;
        let mut assignments = Vec::new();
        loop {
            let column = self.identifier()?;
            self.expect_punct('=')?;
            assignments.push((column, self.expr()?));
            if !self.eat_punct(',') {
                break;
            }
        }
        let filter = self.filter()?;
        Ok(Command::Update {
            table,
            assignments,
            filter,
        })
    }

    fn delete(&mut self) -> SqlResult<Command> {
        self.expect_keyword("DELETE")?;
        self.expect_keyword("FROM")?;
        let table = self.identifier()?;
        let filter = self.filter()?;
        Ok(Command::Delete { table, filter })
    }

    fn call(&mut self) -> SqlResult<Command> {
        let ret = if self.peek() == Some(&Token::Param) {
            self.pos += 1;
            self.expect_punct('=')?;
            Some(self.param())
        } else {
            None
        };
        self.expect_keyword("CALL")?;
        let name = self.identifier()?;
        let mut args = Vec::new();
        if self.eat_punct('(') && !self.eat_punct(')') {
            loop {
                args.push(self.expr()?);
                if self.eat_punct(')') {
                    break;
                }
                self.expect_punct(',')?;
            }
        }
        Ok(Command::Call { name, ret, args })
    }

    fn param(&mut self) -> usize {
        let ordinal = self.params;
        self.params += 1;
        ordinal
    }

    fn expr(&mut self) -> SqlResult<Expr> {
        let negative = self.eat_punct('-');
        let token = self.next();
        let expr = match token {
            Some(Token::Param) if !negative => Expr::Param(self.param()),
            Some(Token::Number(n)) => {
                let literal = if negative { format!("-{}", n) } else { n };
                match literal.parse::<i64>() {
                    Ok(v) => Expr::Literal(Value::Int(v)),
                    Err(_) => Expr::Literal(Value::Double(
                        literal
                            .parse()
                            .map_err(|_| syntax(format!("bad number {}", literal)))?,
                    )),
                }
            }
            Some(Token::Str(s)) if !negative => Expr::Literal(Value::Text(s)),
            Some(Token::Hex(b)) if !negative => Expr::Literal(Value::Bytes(b)),
            Some(Token::Ident(s)) if !negative && s.eq_ignore_ascii_case("NULL") => {
                Expr::Literal(Value::Null)
            }
            Some(Token::Ident(s)) | Some(Token::Quoted(s)) if !negative => {
                if self.eat_punct('.') {
                    Expr::Column(self.identifier()?)
                } else {
                    Expr::Column(s)
                }
            }
            other => return Err(syntax(format!("expected expression, found {:?}", other))),
        };
        Ok(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SqlType;

    #[test]
    fn test_create_table_types_and_constraints() {
        let batch = parse(
            "CREATE TABLE t (id INT NOT NULL PRIMARY KEY, name VARCHAR(20), \
             price DECIMAL(10,2), body TEXT)",
        )
        .unwrap();
        match &batch.commands[0] {
            Command::CreateTable { name, columns } => {
                assert_eq!(name, "t");
                assert_eq!(columns.len(), 4);
                assert!(!columns[0].nullable);
                assert_eq!(columns[1].sql_type, SqlType::Varchar);
                assert_eq!(columns[1].size, 20);
                assert_eq!(columns[2].digits, 2);
                assert!(columns[3].sql_type.is_long());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_param_ordinals_span_batch() {
        let batch = parse("INSERT INTO t VALUES (?, ?); SELECT * FROM t WHERE id = ?").unwrap();
        assert_eq!(batch.commands.len(), 2);
        assert_eq!(batch.param_count, 3);
    }

    #[test]
    fn test_string_escape_and_negative_numbers() {
        let batch = parse("INSERT INTO t VALUES ('it''s', -5, -2.5, NULL, X'0AFF')").unwrap();
        match &batch.commands[0] {
            Command::Insert { rows, .. } => {
                assert_eq!(rows[0][0], Expr::Literal(Value::Text("it's".into())));
                assert_eq!(rows[0][1], Expr::Literal(Value::Int(-5)));
                assert_eq!(rows[0][2], Expr::Literal(Value::Double(-2.5)));
                assert_eq!(rows[0][3], Expr::Literal(Value::Null));
                assert_eq!(rows[0][4], Expr::Literal(Value::Bytes(vec![0x0a, 0xff])));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_call_escape_with_return_marker() {
        let batch = parse("{? = CALL add_one(?)}").unwrap();
        assert_eq!(batch.param_count, 2);
        assert_eq!(
            batch.commands[0],
            Command::Call {
                name: "add_one".into(),
                ret: Some(0),
                args: vec![Expr::Param(1)],
            }
        );
    }

    #[test]
    fn test_select_order_and_alias() {
        let batch = parse("SELECT a AS x, COUNT(*) FROM t ORDER BY a DESC").unwrap();
        match &batch.commands[0] {
            Command::Select { items, order, .. } => {
                assert_eq!(items.len(), 2);
                assert_eq!(order.as_ref().map(|o| o.descending), Some(true));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_syntax_errors_report_42000() {
        assert_eq!(parse("SELEKT 1").unwrap_err().state_str(), "42000");
        assert_eq!(parse("").unwrap_err().state_str(), "42000");
        assert_eq!(parse("SELECT 'open").unwrap_err().state_str(), "42000");
    }
}
