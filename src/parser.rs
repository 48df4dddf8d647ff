//! Hand-written recursive-descent parser over the token stream.
//!
//! One function per grammar production, operator precedence by climbing:
//! OR < AND < NOT < comparison < additive < multiplicative < unary <
//! primary. Every error carries the byte offset of the token that caused
//! it.

use crate::ast::*;
use crate::error::{Error, Result};
use crate::tokenizer::{Tok, Token, Tokenizer};

pub struct Parser<'a> {
    tz: Tokenizer<'a>,
    current: Token,
}

/// Parses a single statement, requiring the input to be fully consumed.
pub fn parse_statement(src: &str) -> Result<Statement> {
    let mut p = Parser::new(src)?;
    let stmt = p.statement()?;
    p.finish()?;
    Ok(stmt)
}

/// Parses a full SELECT (used for subqueries stored in the schema).
pub fn parse_select(src: &str) -> Result<SelectStatement> {
    let mut p = Parser::new(src)?;
    let select = p.select_statement()?;
    p.finish()?;
    Ok(select)
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str) -> Result<Parser<'a>> {
        let mut tz = Tokenizer::new(src);
        let current = tz.next_token()?;
        Ok(Parser { tz, current })
    }

    fn finish(&mut self) -> Result<()> {
        self.accept(Tok::Semicolon)?;
        if self.current.kind != Tok::Eof {
            return Err(self.unexpected("end of statement"));
        }
        Ok(())
    }

    fn unexpected(&self, wanted: &str) -> Error {
        Error::parse(
            self.current.start,
            format!("expected {}, found {:?}", wanted, self.current.kind),
        )
    }

    fn advance(&mut self) -> Result<Token> {
        let t = self.current;
        self.current = self.tz.next_token()?;
        Ok(t)
    }

    fn accept(&mut self, kind: Tok) -> Result<bool> {
        if self.current.kind == kind {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: Tok, wanted: &str) -> Result<Token> {
        if self.current.kind == kind {
            self.advance()
        } else {
            Err(self.unexpected(wanted))
        }
    }

    fn ident(&mut self, wanted: &str) -> Result<String> {
        let t = self.expect(Tok::Ident, wanted)?;
        Ok(t.text(self.tz.source()).to_string())
    }

    /// Unquotes a string literal span, folding doubled quotes.
    fn fold_string(&self, t: Token) -> String {
        t.text(self.tz.source()).replace("''", "'")
    }

    fn fold_blob(&self, t: Token) -> Vec<u8> {
        let hex = t.text(self.tz.source()).as_bytes();
        hex.chunks(2)
            .map(|pair| {
                let hi = (pair[0] as char).to_digit(16).unwrap_or(0) as u8;
                let lo = (pair[1] as char).to_digit(16).unwrap_or(0) as u8;
                (hi << 4) | lo
            })
            .collect()
    }

    // ---- statements ----------------------------------------------------

    pub fn statement(&mut self) -> Result<Statement> {
        match self.current.kind {
            Tok::Select | Tok::With => Ok(Statement::Select(self.select_statement()?)),
            Tok::Create => self.create_statement(),
            Tok::Alter => self.alter_statement(),
            Tok::Drop => self.drop_statement(),
            Tok::Insert => self.insert_statement(),
            Tok::Update => self.update_statement(),
            Tok::Delete => self.delete_statement(),
            _ => Err(self.unexpected("a statement")),
        }
    }

    fn create_statement(&mut self) -> Result<Statement> {
        self.expect(Tok::Create, "CREATE")?;
        let unique = self.accept(Tok::Unique)?;
        if self.accept(Tok::Table)? {
            if unique {
                return Err(self.unexpected("INDEX after UNIQUE"));
            }
            let if_not_exists = self.if_not_exists()?;
            let name = self.ident("table name")?;
            self.expect(Tok::LParen, "(")?;
            let mut columns = vec![self.column_def()?];
            while self.accept(Tok::Comma)? {
                columns.push(self.column_def()?);
            }
            self.expect(Tok::RParen, ")")?;
            return Ok(Statement::CreateTable(CreateTableStatement {
                name,
                if_not_exists,
                columns,
            }));
        }
        self.expect(Tok::Index, "TABLE or INDEX")?;
        let if_not_exists = self.if_not_exists()?;
        let name = self.ident("index name")?;
        self.expect(Tok::On, "ON")?;
        let table = self.ident("table name")?;
        self.expect(Tok::LParen, "(")?;
        let mut columns = vec![self.ident("column name")?];
        while self.accept(Tok::Comma)? {
            columns.push(self.ident("column name")?);
        }
        self.expect(Tok::RParen, ")")?;
        Ok(Statement::CreateIndex(CreateIndexStatement {
            name,
            table,
            columns,
            unique,
            if_not_exists,
        }))
    }

    fn if_not_exists(&mut self) -> Result<bool> {
        if self.accept(Tok::If)? {
            self.expect(Tok::Not, "NOT")?;
            self.expect(Tok::Exists, "EXISTS")?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn column_def(&mut self) -> Result<ColumnDef> {
        let name = self.ident("column name")?;
        let declared_type = self.type_name()?;
        let mut def = ColumnDef {
            name,
            declared_type,
            is_primary_key: false,
            is_not_null: false,
            is_unique: false,
        };
        loop {
            if self.accept(Tok::Primary)? {
                self.expect(Tok::Key, "KEY")?;
                def.is_primary_key = true;
            } else if self.accept(Tok::Not)? {
                self.expect(Tok::Null, "NULL")?;
                def.is_not_null = true;
            } else if self.accept(Tok::Unique)? {
                def.is_unique = true;
            } else {
                break;
            }
        }
        Ok(def)
    }

    /// A declared type: identifier words, optionally followed by a
    /// parenthesized size like `DECIMAL(20,6)` or `VARCHAR(80)`.
    fn type_name(&mut self) -> Result<String> {
        let mut parts = vec![];
        while self.current.kind == Tok::Ident {
            parts.push(self.ident("type name")?);
        }
        let mut name = parts.join(" ");
        if name.is_empty() {
            return Ok(name);
        }
        if self.accept(Tok::LParen)? {
            name.push('(');
            let t = self.expect(Tok::IntegerLit, "type size")?;
            name.push_str(&t.int_val.to_string());
            if self.accept(Tok::Comma)? {
                let t = self.expect(Tok::IntegerLit, "type scale")?;
                name.push(',');
                name.push_str(&t.int_val.to_string());
            }
            self.expect(Tok::RParen, ")")?;
            name.push(')');
        }
        Ok(name)
    }

    fn alter_statement(&mut self) -> Result<Statement> {
        self.expect(Tok::Alter, "ALTER")?;
        self.expect(Tok::Table, "TABLE")?;
        let table = self.ident("table name")?;
        if self.accept(Tok::Rename)? {
            self.expect(Tok::To, "TO")?;
            let new_name = self.ident("new table name")?;
            return Ok(Statement::AlterRename { table, new_name });
        }
        self.expect(Tok::Add, "ADD or RENAME")?;
        self.accept(Tok::Column)?;
        let column = self.column_def()?;
        Ok(Statement::AlterAddColumn { table, column })
    }

    fn drop_statement(&mut self) -> Result<Statement> {
        self.expect(Tok::Drop, "DROP")?;
        let kind = match self.current.kind {
            Tok::Table => DropKind::Table,
            Tok::Index => DropKind::Index,
            Tok::View => DropKind::View,
            _ => return Err(self.unexpected("TABLE, INDEX or VIEW")),
        };
        self.advance()?;
        let if_exists = if self.accept(Tok::If)? {
            self.expect(Tok::Exists, "EXISTS")?;
            true
        } else {
            false
        };
        let name = self.ident("object name")?;
        Ok(Statement::Drop {
            kind,
            name,
            if_exists,
        })
    }

    fn insert_statement(&mut self) -> Result<Statement> {
        self.expect(Tok::Insert, "INSERT")?;
        self.expect(Tok::Into, "INTO")?;
        let table = self.ident("table name")?;
        let columns = if self.accept(Tok::LParen)? {
            let mut cols = vec![self.ident("column name")?];
            while self.accept(Tok::Comma)? {
                cols.push(self.ident("column name")?);
            }
            self.expect(Tok::RParen, ")")?;
            Some(cols)
        } else {
            None
        };
        self.expect(Tok::Values, "VALUES")?;
        let mut rows = vec![];
        loop {
            self.expect(Tok::LParen, "(")?;
            let mut row = vec![self.expr()?];
            while self.accept(Tok::Comma)? {
                row.push(self.expr()?);
            }
            self.expect(Tok::RParen, ")")?;
            rows.push(row);
            if !self.accept(Tok::Comma)? {
                break;
            }
        }
        Ok(Statement::Insert(InsertStatement {
            table,
            columns,
            rows,
        }))
    }

    fn update_statement(&mut self) -> Result<Statement> {
        self.expect(Tok::Update, "UPDATE")?;
        let table = self.ident("table name")?;
        self.expect(Tok::Set, "SET")?;
        let mut assignments = vec![];
        loop {
            let col = self.ident("column name")?;
            self.expect(Tok::Eq, "=")?;
            assignments.push((col, self.expr()?));
            if !self.accept(Tok::Comma)? {
                break;
            }
        }
        let filter = if self.accept(Tok::Where)? {
            Some(self.expr()?)
        } else {
            None
        };
        Ok(Statement::Update(UpdateStatement {
            table,
            assignments,
            filter,
        }))
    }

    fn delete_statement(&mut self) -> Result<Statement> {
        self.expect(Tok::Delete, "DELETE")?;
        self.expect(Tok::From, "FROM")?;
        let table = self.ident("table name")?;
        let filter = if self.accept(Tok::Where)? {
            Some(self.expr()?)
        } else {
            None
        };
        Ok(Statement::Delete(DeleteStatement { table, filter }))
    }

    // ---- select --------------------------------------------------------

    pub fn select_statement(&mut self) -> Result<SelectStatement> {
        let mut ctes = vec![];
        if self.accept(Tok::With)? {
            loop {
                let name = self.ident("CTE name")?;
                self.expect(Tok::As, "AS")?;
                self.expect(Tok::LParen, "(")?;
                let select = self.select_statement()?;
                self.expect(Tok::RParen, ")")?;
                ctes.push(CommonTableExpr { name, select });
                if !self.accept(Tok::Comma)? {
                    break;
                }
            }
        }
        let body = self.select_body()?;
        let mut order_by = vec![];
        if self.accept(Tok::Order)? {
            self.expect(Tok::By, "BY")?;
            loop {
                order_by.push(self.order_key()?);
                if !self.accept(Tok::Comma)? {
                    break;
                }
            }
        }
        let mut limit = None;
        let mut offset = None;
        if self.accept(Tok::Limit)? {
            limit = Some(self.expr()?);
            if self.accept(Tok::Offset)? {
                offset = Some(self.expr()?);
            }
        }
        Ok(SelectStatement {
            ctes,
            body,
            order_by,
            limit,
            offset,
        })
    }

    fn order_key(&mut self) -> Result<OrderKey> {
        let expr = self.expr()?;
        let descending = if self.accept(Tok::Desc)? {
            true
        } else {
            self.accept(Tok::Asc)?;
            false
        };
        let nulls_first = if self.accept(Tok::Nulls)? {
            if self.accept(Tok::First)? {
                Some(true)
            } else {
                self.expect(Tok::Last, "FIRST or LAST")?;
                Some(false)
            }
        } else {
            None
        };
        Ok(OrderKey {
            expr,
            descending,
            nulls_first,
        })
    }

    fn select_body(&mut self) -> Result<SelectBody> {
        let mut body = SelectBody::Simple(self.select_core()?);
        loop {
            let op = match self.current.kind {
                Tok::Union => CompoundOp::Union,
                Tok::Intersect => CompoundOp::Intersect,
                Tok::Except => CompoundOp::Except,
                _ => break,
            };
            self.advance()?;
            let all = op == CompoundOp::Union && self.accept(Tok::All)?;
            let right = SelectBody::Simple(self.select_core()?);
            body = SelectBody::Compound {
                op,
                all,
                left: Box::new(body),
                right: Box::new(right),
            };
        }
        Ok(body)
    }

    fn select_core(&mut self) -> Result<SelectCore> {
        self.expect(Tok::Select, "SELECT")?;
        let distinct = if self.accept(Tok::Distinct)? {
            true
        } else {
            self.accept(Tok::All)?;
            false
        };
        let mut items = vec![self.select_item()?];
        while self.accept(Tok::Comma)? {
            items.push(self.select_item()?);
        }
        let mut from = None;
        let mut joins = vec![];
        if self.accept(Tok::From)? {
            from = Some(self.from_source()?);
            loop {
                let kind = match self.current.kind {
                    Tok::Join => JoinKind::Inner,
                    Tok::Inner => {
                        self.advance()?;
                        JoinKind::Inner
                    }
                    Tok::Left => {
                        self.advance()?;
                        JoinKind::Left
                    }
                    Tok::Cross => {
                        self.advance()?;
                        JoinKind::Cross
                    }
                    _ => break,
                };
                self.expect(Tok::Join, "JOIN")?;
                let source = self.from_source()?;
                let on = if self.accept(Tok::On)? {
                    Some(self.expr()?)
                } else {
                    None
                };
                joins.push(Join { kind, source, on });
            }
        }
        let filter = if self.accept(Tok::Where)? {
            Some(self.expr()?)
        } else {
            None
        };
        let mut group_by = vec![];
        let mut having = None;
        if self.accept(Tok::Group)? {
            self.expect(Tok::By, "BY")?;
            loop {
                group_by.push(self.expr()?);
                if !self.accept(Tok::Comma)? {
                    break;
                }
            }
            if self.accept(Tok::Having)? {
                having = Some(self.expr()?);
            }
        }
        Ok(SelectCore {
            distinct,
            items,
            from,
            joins,
            filter,
            group_by,
            having,
        })
    }

    fn select_item(&mut self) -> Result<SelItem> {
        if self.accept(Tok::Star)? {
            return Ok(SelItem::Star);
        }
        let expr = self.expr()?;
        let alias = if self.accept(Tok::As)? {
            Some(self.ident("alias")?)
        } else if self.current.kind == Tok::Ident {
            Some(self.ident("alias")?)
        } else {
            None
        };
        Ok(SelItem::Expr { expr, alias })
    }

    fn from_source(&mut self) -> Result<FromSource> {
        let mut source = if self.accept(Tok::LParen)? {
            let select = self.select_statement()?;
            self.expect(Tok::RParen, ")")?;
            let alias = self.source_alias()?;
            FromSource::Subquery {
                select: Box::new(select),
                alias,
            }
        } else {
            let name = self.ident("table name")?;
            let alias = self.source_alias()?;
            FromSource::Table { name, alias }
        };
        loop {
            let op = match self.current.kind {
                Tok::ArrowRight => ArrowOp::Forward,
                Tok::ArrowLeft => ArrowOp::Backward,
                Tok::ArrowBoth => ArrowOp::Both,
                _ => break,
            };
            self.advance()?;
            let target = self.ident("traversal target")?;
            source = FromSource::Traverse {
                base: Box::new(source),
                op,
                target,
            };
        }
        Ok(source)
    }

    fn source_alias(&mut self) -> Result<Option<String>> {
        if self.accept(Tok::As)? {
            Ok(Some(self.ident("alias")?))
        } else if self.current.kind == Tok::Ident {
            Ok(Some(self.ident("alias")?))
        } else {
            Ok(None)
        }
    }

    // ---- expressions ---------------------------------------------------

    pub fn expr(&mut self) -> Result<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and_expr()?;
        while self.accept(Tok::Or)? {
            let rhs = self.and_expr()?;
            lhs = Expr::BinOp {
                lhs: Box::new(lhs),
                op: Op::Or,
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.not_expr()?;
        while self.accept(Tok::And)? {
            let rhs = self.not_expr()?;
            lhs = Expr::BinOp {
                lhs: Box::new(lhs),
                op: Op::And,
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Expr> {
        if self.accept(Tok::Not)? {
            let expr = self.not_expr()?;
            return Ok(Expr::Unary {
                op: UnOp::Not,
                expr: Box::new(expr),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.current.kind {
                Tok::Eq => Some(Op::Eq),
                Tok::Ne => Some(Op::Ne),
                Tok::Lt => Some(Op::Lt),
                Tok::Le => Some(Op::Le),
                Tok::Gt => Some(Op::Gt),
                Tok::Ge => Some(Op::Ge),
                _ => None,
            };
            if let Some(op) = op {
                self.advance()?;
                let rhs = self.additive()?;
                lhs = Expr::BinOp {
                    lhs: Box::new(lhs),
                    op,
                    rhs: Box::new(rhs),
                };
                continue;
            }
            if self.accept(Tok::Is)? {
                let negated = self.accept(Tok::Not)?;
                self.expect(Tok::Null, "NULL")?;
                lhs = Expr::IsNull {
                    expr: Box::new(lhs),
                    negated,
                };
                continue;
            }
            let negated = if self.current.kind == Tok::Not {
                // Only NOT IN / NOT BETWEEN / NOT LIKE are valid here.
                match self.peek_after_not() {
                    Some(Tok::In) | Some(Tok::Between) | Some(Tok::Like) => {
                        self.advance()?;
                        true
                    }
                    _ => break,
                }
            } else {
                false
            };
            if self.accept(Tok::In)? {
                self.expect(Tok::LParen, "(")?;
                let mut list = vec![self.expr()?];
                while self.accept(Tok::Comma)? {
                    list.push(self.expr()?);
                }
                self.expect(Tok::RParen, ")")?;
                lhs = Expr::InList {
                    expr: Box::new(lhs),
                    list,
                    negated,
                };
                continue;
            }
            if self.accept(Tok::Between)? {
                let low = self.additive()?;
                self.expect(Tok::And, "AND")?;
                let high = self.additive()?;
                lhs = Expr::Between {
                    expr: Box::new(lhs),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated,
                };
                continue;
            }
            if self.accept(Tok::Like)? {
                let pattern = self.additive()?;
                lhs = Expr::Like {
                    expr: Box::new(lhs),
                    pattern: Box::new(pattern),
                    negated,
                };
                continue;
            }
            if negated {
                return Err(self.unexpected("IN, BETWEEN or LIKE after NOT"));
            }
            break;
        }
        Ok(lhs)
    }

    /// One-token lookahead past a NOT, without consuming it.
    fn peek_after_not(&mut self) -> Option<Tok> {
        let mut probe = Tokenizer::new(self.tz.source());
        // Re-scan from the token after NOT. The tokenizer is cheap enough
        // that a fresh probe beats buffering a lookahead queue.
        let mut probe_pos_token = None;
        loop {
            match probe.next_token() {
                Ok(t) => {
                    if t.start > self.current.start {
                        probe_pos_token = Some(t.kind);
                        break;
                    }
                    if t.kind == Tok::Eof {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        probe_pos_token
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.current.kind {
                Tok::Plus => Op::Add,
                Tok::Minus => Op::Subtract,
                _ => break,
            };
            self.advance()?;
            let rhs = self.multiplicative()?;
            lhs = Expr::BinOp {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.current.kind {
                Tok::Star => Op::Multiply,
                Tok::Slash => Op::Divide,
                Tok::Percent => Op::Modulo,
                _ => break,
            };
            self.advance()?;
            let rhs = self.unary()?;
            lhs = Expr::BinOp {
                lhs: Box::new(lhs),
                op,
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.accept(Tok::Minus)? {
            let expr = self.unary()?;
            return Ok(Expr::Unary {
                op: UnOp::Neg,
                expr: Box::new(expr),
            });
        }
        if self.accept(Tok::Plus)? {
            return self.unary();
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.current.kind {
            Tok::IntegerLit => {
                let t = self.advance()?;
                Ok(Expr::Constant(Constant::Int(t.int_val)))
            }
            Tok::FloatLit => {
                let t = self.advance()?;
                Ok(Expr::Constant(Constant::Real(t.float_val)))
            }
            Tok::StringLit => {
                let t = self.advance()?;
                Ok(Expr::Constant(Constant::String(self.fold_string(t))))
            }
            Tok::BlobLit => {
                let t = self.advance()?;
                Ok(Expr::Constant(Constant::Blob(self.fold_blob(t))))
            }
            Tok::Null => {
                self.advance()?;
                Ok(Expr::Constant(Constant::Null()))
            }
            Tok::Param => {
                let t = self.advance()?;
                Ok(Expr::Param(t.text(self.tz.source()).to_string()))
            }
            Tok::Case => self.case_expr(),
            Tok::Cast => {
                self.advance()?;
                self.expect(Tok::LParen, "(")?;
                let expr = self.expr()?;
                self.expect(Tok::As, "AS")?;
                let type_name = self.type_name()?;
                self.expect(Tok::RParen, ")")?;
                Ok(Expr::Cast {
                    expr: Box::new(expr),
                    type_name,
                })
            }
            Tok::LParen => {
                self.advance()?;
                let expr = self.expr()?;
                self.expect(Tok::RParen, ")")?;
                Ok(expr)
            }
            Tok::Ident => {
                let first = self.ident("identifier")?;
                if self.accept(Tok::LParen)? {
                    return self.call_tail(first);
                }
                if self.accept(Tok::Dot)? {
                    let name = self.ident("column name")?;
                    return Ok(Expr::Column(ColumnRef {
                        table: Some(first),
                        name,
                    }));
                }
                match first.to_uppercase().as_str() {
                    "TRUE" => Ok(Expr::Constant(Constant::Bool(true))),
                    "FALSE" => Ok(Expr::Constant(Constant::Bool(false))),
                    _ => Ok(Expr::Column(ColumnRef {
                        table: None,
                        name: first,
                    })),
                }
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    fn call_tail(&mut self, name: String) -> Result<Expr> {
        if self.accept(Tok::Star)? {
            self.expect(Tok::RParen, ")")?;
            return Ok(Expr::Call {
                name,
                args: vec![],
                star: true,
                distinct: false,
            });
        }
        let distinct = self.accept(Tok::Distinct)?;
        let mut args = vec![];
        if self.current.kind != Tok::RParen {
            args.push(self.expr()?);
            while self.accept(Tok::Comma)? {
                args.push(self.expr()?);
            }
        }
        self.expect(Tok::RParen, ")")?;
        Ok(Expr::Call {
            name,
            args,
            star: false,
            distinct,
        })
    }

    fn case_expr(&mut self) -> Result<Expr> {
        self.expect(Tok::Case, "CASE")?;
        let operand = if self.current.kind != Tok::When {
            Some(Box::new(self.expr()?))
        } else {
            None
        };
        let mut arms = vec![];
        while self.accept(Tok::When)? {
            let when = self.expr()?;
            self.expect(Tok::Then, "THEN")?;
            let then = self.expr()?;
            arms.push((when, then));
        }
        if arms.is_empty() {
            return Err(self.unexpected("WHEN"));
        }
        let otherwise = if self.accept(Tok::Else)? {
            Some(Box::new(self.expr()?))
        } else {
            None
        };
        self.expect(Tok::End, "END")?;
        Ok(Expr::Case {
            operand,
            arms,
            otherwise,
        })
    }
}
