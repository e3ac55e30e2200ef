// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::rc::Rc;

use super::ast::*;
use super::lexer::{tokenize, Token};
use super::LangError;

/// Parses a source string into its single declaration.
pub fn parse_declaration(source: &str) -> Result<Decl, LangError> {
    let mut p = Parser {
        tokens: tokenize(source)?,
        pos: 0,
    };
    let decl = p.declaration()?;
    p.expect_eof()?;
    Ok(decl)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn next(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.peek().is_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), LangError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(LangError::Parse(format!(
                "expected {:?}, found {:?}",
                p,
                self.peek()
            )))
        }
    }

    fn eat_ident(&mut self, name: &str) -> bool {
        if self.peek().is_ident(name) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_name(&mut self) -> Result<String, LangError> {
        match self.next() {
            Token::Ident(name) => Ok(name),
            other => Err(LangError::Parse(format!("expected name, found {other:?}"))),
        }
    }

    fn expect_eof(&mut self) -> Result<(), LangError> {
        if matches!(self.peek(), Token::Eof) {
            Ok(())
        } else {
            Err(LangError::Parse(format!(
                "trailing tokens after declaration: {:?}",
                self.peek()
            )))
        }
    }

    fn declaration(&mut self) -> Result<Decl, LangError> {
        if self.eat_ident("class") {
            return Ok(Decl::Class(self.class_decl()?));
        }
        if self.eat_ident("function") {
            let name = self.expect_name()?;
            let params = self.param_list()?;
            let body = self.block()?;
            return Ok(Decl::Function(FunctionDecl { name, params, body }));
        }
        Err(LangError::Parse(
            "source must be a class or function declaration".into(),
        ))
    }

    fn class_decl(&mut self) -> Result<ClassDecl, LangError> {
        let name = self.expect_name()?;
        let parent = if self.eat_ident("extends") {
            Some(self.expect_name()?)
        } else {
            None
        };
        self.expect_punct("{")?;
        let mut methods = Vec::new();
        while !self.eat_punct("}") {
            if self.eat_punct(";") {
                continue;
            }
            let mut is_static = false;
            let mut name = self.expect_name()?;
            // `static` is a modifier unless it is itself the method name.
            if name == "static" && !self.peek().is_punct("(") {
                is_static = true;
                name = self.expect_name()?;
            }
            let params = self.param_list()?;
            let body = self.block()?;
            methods.push(MethodDecl {
                name,
                is_static,
                params,
                body,
            });
        }
        Ok(ClassDecl {
            name,
            parent,
            methods,
        })
    }

    fn param_list(&mut self) -> Result<Vec<String>, LangError> {
        self.expect_punct("(")?;
        let mut params = Vec::new();
        if !self.eat_punct(")") {
            loop {
                params.push(self.expect_name()?);
                if self.eat_punct(")") {
                    break;
                }
                self.expect_punct(",")?;
            }
        }
        Ok(params)
    }

    fn block(&mut self) -> Result<Block, LangError> {
        self.expect_punct("{")?;
        let mut stmts = Vec::new();
        while !self.eat_punct("}") {
            stmts.push(self.statement()?);
        }
        Ok(stmts)
    }

    /// A braced block, or a single statement promoted to one.
    fn block_or_single(&mut self) -> Result<Block, LangError> {
        if self.peek().is_punct("{") {
            self.block()
        } else {
            Ok(vec![self.statement()?])
        }
    }

    fn statement(&mut self) -> Result<Stmt, LangError> {
        if self.eat_ident("let") || self.eat_ident("const") || self.eat_ident("var") {
            let name = self.expect_name()?;
            let init = if self.eat_punct("=") {
                Some(self.expression()?)
            } else {
                None
            };
            self.eat_punct(";");
            return Ok(Stmt::Let { name, init });
        }
        if self.eat_ident("if") {
            self.expect_punct("(")?;
            let cond = self.expression()?;
            self.expect_punct(")")?;
            let then = self.block_or_single()?;
            let otherwise = if self.eat_ident("else") {
                Some(self.block_or_single()?)
            } else {
                None
            };
            return Ok(Stmt::If {
                cond,
                then,
                otherwise,
            });
        }
        if self.eat_ident("while") {
            self.expect_punct("(")?;
            let cond = self.expression()?;
            self.expect_punct(")")?;
            let body = self.block_or_single()?;
            return Ok(Stmt::While { cond, body });
        }
        if self.eat_ident("for") {
            self.expect_punct("(")?;
            if !(self.eat_ident("let") || self.eat_ident("const") || self.eat_ident("var")) {
                return Err(LangError::Parse("for loops must declare their binding".into()));
            }
            let name = self.expect_name()?;
            if !self.eat_ident("of") {
                return Err(LangError::Parse(
                    "only for…of iteration is supported".into(),
                ));
            }
            let iter = self.expression()?;
            self.expect_punct(")")?;
            let body = self.block_or_single()?;
            return Ok(Stmt::ForOf { name, iter, body });
        }
        if self.eat_ident("return") {
            let value = if self.peek().is_punct(";")
                || self.peek().is_punct("}")
                || matches!(self.peek(), Token::Eof)
            {
                None
            } else {
                Some(self.expression()?)
            };
            self.eat_punct(";");
            return Ok(Stmt::Return(value));
        }
        if self.eat_ident("throw") {
            let value = self.expression()?;
            self.eat_punct(";");
            return Ok(Stmt::Throw(value));
        }

        // Expression statement, possibly an assignment.
        let expr = self.expression()?;
        let op = if self.eat_punct("=") {
            Some(AssignOp::Assign)
        } else if self.eat_punct("+=") {
            Some(AssignOp::Add)
        } else if self.eat_punct("-=") {
            Some(AssignOp::Sub)
        } else {
            None
        };
        let stmt = match op {
            Some(op) => {
                if !matches!(expr, Expr::Ident(_) | Expr::Member { .. } | Expr::Index { .. }) {
                    return Err(LangError::Parse("invalid assignment target".into()));
                }
                let value = self.expression()?;
                Stmt::Assign {
                    target: expr,
                    op,
                    value,
                }
            }
            None => Stmt::Expr(expr),
        };
        self.eat_punct(";");
        Ok(stmt)
    }

    fn expression(&mut self) -> Result<Expr, LangError> {
        self.logical_or()
    }

    fn logical_or(&mut self) -> Result<Expr, LangError> {
        let mut lhs = self.logical_and()?;
        while self.eat_punct("||") {
            let rhs = self.logical_and()?;
            lhs = Expr::Logical {
                and: false,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn logical_and(&mut self) -> Result<Expr, LangError> {
        let mut lhs = self.equality()?;
        while self.eat_punct("&&") {
            let rhs = self.equality()?;
            lhs = Expr::Logical {
                and: true,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, LangError> {
        let mut lhs = self.relational()?;
        loop {
            let op = if self.eat_punct("===") {
                BinOp::StrictEq
            } else if self.eat_punct("!==") {
                BinOp::StrictNe
            } else if self.eat_punct("==") {
                BinOp::Eq
            } else if self.eat_punct("!=") {
                BinOp::Ne
            } else {
                return Ok(lhs);
            };
            let rhs = self.relational()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn relational(&mut self) -> Result<Expr, LangError> {
        let mut lhs = self.additive()?;
        loop {
            let op = if self.eat_punct("<=") {
                BinOp::Le
            } else if self.eat_punct(">=") {
                BinOp::Ge
            } else if self.eat_punct("<") {
                BinOp::Lt
            } else if self.eat_punct(">") {
                BinOp::Gt
            } else {
                return Ok(lhs);
            };
            let rhs = self.additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn additive(&mut self) -> Result<Expr, LangError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = if self.eat_punct("+") {
                BinOp::Add
            } else if self.eat_punct("-") {
                BinOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, LangError> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat_punct("*") {
                BinOp::Mul
            } else if self.eat_punct("/") {
                BinOp::Div
            } else if self.eat_punct("%") {
                BinOp::Mod
            } else {
                return Ok(lhs);
            };
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, LangError> {
        let op = if self.eat_punct("-") {
            Some(UnaryOp::Neg)
        } else if self.eat_punct("!") {
            Some(UnaryOp::Not)
        } else if self.eat_ident("typeof") {
            Some(UnaryOp::TypeOf)
        } else {
            None
        };
        match op {
            Some(op) => Ok(Expr::Unary {
                op,
                expr: Box::new(self.unary()?),
            }),
            None => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, LangError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_punct(".") {
                let name = self.expect_name()?;
                expr = Expr::Member {
                    obj: Box::new(expr),
                    name,
                };
            } else if self.eat_punct("[") {
                let index = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Index {
                    obj: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.peek().is_punct("(") {
                let args = self.arg_list()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn arg_list(&mut self) -> Result<Vec<Expr>, LangError> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        if !self.eat_punct(")") {
            loop {
                args.push(self.expression()?);
                if self.eat_punct(")") {
                    break;
                }
                self.expect_punct(",")?;
            }
        }
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, LangError> {
        if self.eat_ident("new") {
            // A member chain names the class; the argument list follows.
            let mut callee = self.primary()?;
            while self.eat_punct(".") {
                let name = self.expect_name()?;
                callee = Expr::Member {
                    obj: Box::new(callee),
                    name,
                };
            }
            let args = if self.peek().is_punct("(") {
                self.arg_list()?
            } else {
                Vec::new()
            };
            return Ok(Expr::New {
                callee: Box::new(callee),
                args,
            });
        }

        if self.peek().is_punct("(") {
            if let Some(arrow) = self.try_arrow()? {
                return Ok(arrow);
            }
            self.expect_punct("(")?;
            let expr = self.expression()?;
            self.expect_punct(")")?;
            return Ok(expr);
        }

        if self.eat_punct("[") {
            let mut items = Vec::new();
            if !self.eat_punct("]") {
                loop {
                    items.push(self.expression()?);
                    if self.eat_punct("]") {
                        break;
                    }
                    self.expect_punct(",")?;
                }
            }
            return Ok(Expr::ArrayLit(items));
        }

        if self.eat_punct("{") {
            let mut fields = Vec::new();
            if !self.eat_punct("}") {
                loop {
                    let key = match self.next() {
                        Token::Ident(name) => name,
                        Token::Str(s) => s,
                        Token::Int(n) => n.to_string(),
                        other => {
                            return Err(LangError::Parse(format!(
                                "bad object key: {other:?}"
                            )))
                        }
                    };
                    let value = if self.eat_punct(":") {
                        self.expression()?
                    } else {
                        // Shorthand { a } binds the identifier.
                        Expr::Ident(key.clone())
                    };
                    fields.push((key, value));
                    if self.eat_punct("}") {
                        break;
                    }
                    self.expect_punct(",")?;
                }
            }
            return Ok(Expr::ObjectLit(fields));
        }

        match self.next() {
            Token::Int(n) => Ok(Expr::Int(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                "undefined" => Ok(Expr::Undefined),
                "this" => Ok(Expr::This),
                _ => {
                    if self.eat_punct("=>") {
                        return self.arrow_tail(vec![name]);
                    }
                    Ok(Expr::Ident(name))
                }
            },
            other => Err(LangError::Parse(format!(
                "unexpected token {other:?}"
            ))),
        }
    }

    /// Attempts `(a, b) => …`, rewinding on failure.
    fn try_arrow(&mut self) -> Result<Option<Expr>, LangError> {
        let save = self.pos;
        self.expect_punct("(")?;
        let mut params = Vec::new();
        let ok = loop {
            if self.eat_punct(")") {
                break true;
            }
            match self.next() {
                Token::Ident(name) => params.push(name),
                _ => break false,
            }
            if self.eat_punct(")") {
                break true;
            }
            if !self.eat_punct(",") {
                break false;
            }
        };
        if !ok || !self.eat_punct("=>") {
            self.pos = save;
            return Ok(None);
        }
        Ok(Some(self.arrow_tail(params)?))
    }

    fn arrow_tail(&mut self, params: Vec<String>) -> Result<Expr, LangError> {
        let body = if self.peek().is_punct("{") {
            ArrowKind::Block(self.block()?)
        } else {
            ArrowKind::Expr(self.expression()?)
        };
        Ok(Expr::Arrow(Rc::new(ArrowBody { params, body })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_trivial_class() {
        let decl = parse_declaration("class A {}").unwrap();
        assert_eq!(
            decl,
            Decl::Class(ClassDecl {
                name: "A".into(),
                parent: None,
                methods: vec![],
            })
        );
    }

    #[test]
    fn parses_methods_and_statics() {
        let src = "class Counter extends Jig {
            init(start) { this.count = start }
            inc() { this.count += 1 }
            static origin() { return 0 }
        }";
        let Decl::Class(class) = parse_declaration(src).unwrap() else {
            panic!("expected class");
        };
        assert_eq!(class.parent.as_deref(), Some("Jig"));
        assert_eq!(class.methods.len(), 3);
        assert!(class.method("origin", true).is_some());
        assert!(class.method("inc", false).is_some());
        assert!(class.method("inc", true).is_none());
    }

    #[test]
    fn parses_arrows_in_sort_comparators() {
        let src = "function f(list) { return list.sort((a, b) => a.k - b.k) }";
        let Decl::Function(func) = parse_declaration(src).unwrap() else {
            panic!("expected function");
        };
        let Stmt::Return(Some(Expr::Call { args, .. })) = &func.body[0] else {
            panic!("expected return of a call");
        };
        assert!(matches!(args[0], Expr::Arrow(_)));
    }

    #[test]
    fn parses_control_flow() {
        let src = "function f(xs) {
            let total = 0
            for (const x of xs) {
                if (x > 2) { total += x } else { total -= 1 }
            }
            while (total > 100) { total = total - 100 }
            return total
        }";
        assert!(parse_declaration(src).is_ok());
    }

    #[test]
    fn rejects_two_declarations() {
        assert!(parse_declaration("class A {} class B {}").is_err());
    }

    #[test]
    fn rejects_for_in() {
        assert!(parse_declaration("function f(o) { for (let k in o) {} }").is_err());
    }

    #[test]
    fn parses_new_expressions() {
        let src = "function f() { return new Token(10) }";
        assert!(parse_declaration(src).is_ok());
    }
}
