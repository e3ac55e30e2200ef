// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The method-body evaluator.
//!
//! Executes class templates against the heap, with every creation access
//! mediated by the membrane and every intrinsic supplied by the realm.
//! Inner containers obtained from creations carry provenance: containers
//! of the running method's own creation record updates when mutated,
//! containers of foreign or immutable creations are frozen.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use rvm_shared::{Result, RvmError};

use crate::creation::{Creation, CreationKind};
use crate::heap::{CreationId, Heap};
use crate::lang::ast::{ArrowKind, AssignOp, BinOp, Decl, Expr, MethodDecl, Stmt, UnaryOp};
use crate::membrane::{self, MethodCtx, Rules};
use crate::realm;
use crate::record::Record;
use crate::value::{Closure, PropKey, Props, Value};

/// Ceiling on evaluation steps per top-level action; a deterministic
/// stand-in for gas.
pub const MAX_STEPS: u64 = 1_000_000;

const NAMESPACES: [&str; 3] = ["Object", "JSON", "Math"];

pub type Env = Rc<RefCell<Scope>>;

pub struct Scope {
    vars: HashMap<String, Value>,
    parent: Option<Env>,
}

impl Scope {
    pub fn root() -> Env {
        Rc::new(RefCell::new(Scope {
            vars: HashMap::new(),
            parent: None,
        }))
    }

    pub fn child(parent: &Env) -> Env {
        Rc::new(RefCell::new(Scope {
            vars: HashMap::new(),
            parent: Some(parent.clone()),
        }))
    }

    fn lookup(env: &Env, name: &str) -> Option<Value> {
        let scope = env.borrow();
        if let Some(v) = scope.vars.get(name) {
            return Some(v.clone());
        }
        scope.parent.as_ref().and_then(|p| Self::lookup(p, name))
    }

    fn assign(env: &Env, name: &str, value: Value) -> bool {
        let mut scope = env.borrow_mut();
        if scope.vars.contains_key(name) {
            scope.vars.insert(name.to_owned(), value);
            return true;
        }
        match &scope.parent {
            Some(p) => Self::assign(p, name, value),
            None => false,
        }
    }

    fn declare(env: &Env, name: &str, value: Value) {
        env.borrow_mut().vars.insert(name.to_owned(), value);
    }
}

/// One executing method.
struct Frame {
    this: Value,
    /// Class whose method body runs; unlocks `_` names.
    class: Option<CreationId>,
    caller: Option<CreationId>,
    env: Env,
    /// Containers owned by the frame's creation: mutating one records an
    /// update against it.
    owned: Rc<RefCell<HashMap<usize, CreationId>>>,
    /// Containers read from foreign or immutable creations: frozen here.
    foreign: Rc<RefCell<HashSet<usize>>>,
}

impl Frame {
    fn ctx(&self) -> MethodCtx {
        MethodCtx {
            this: self.this_id(),
            class: self.class,
            caller: self.caller,
        }
    }

    fn this_id(&self) -> Option<CreationId> {
        match &self.this {
            Value::Creation(id) => Some(*id),
            _ => None,
        }
    }
}

/// Berry construction context, set only while a pluck runs.
pub struct PluckCtx<'a> {
    pub path: String,
    pub fetch: &'a dyn Fn(&str) -> Result<Value>,
    pub created: Option<CreationId>,
}

pub struct Interp<'a> {
    pub heap: &'a mut Heap,
    pub record: &'a mut Record,
    pub natives: &'a HashMap<String, CreationId>,
    pub backing_limit: u64,
    pub pluck: Option<PluckCtx<'a>>,
    steps: u64,
}

impl<'a> Interp<'a> {
    pub fn new(
        heap: &'a mut Heap,
        record: &'a mut Record,
        natives: &'a HashMap<String, CreationId>,
        backing_limit: u64,
    ) -> Self {
        Interp {
            heap,
            record,
            natives,
            backing_limit,
            pluck: None,
            steps: 0,
        }
    }

    fn step(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps > MAX_STEPS {
            return Err(RvmError::execution("evaluation step limit exceeded"));
        }
        Ok(())
    }

    fn err(msg: impl Into<String>) -> RvmError {
        RvmError::execution(msg.into())
    }

    // ---- class structure ------------------------------------------------

    fn native(&self, ident: &str) -> Result<CreationId> {
        self.natives
            .get(ident)
            .copied()
            .ok_or_else(|| RvmError::internal(format!("native {ident} not registered")))
    }

    fn deps_lookup(&self, class: CreationId, name: &str) -> Option<Value> {
        let creation = self.heap.get(class);
        let props = creation.props.borrow();
        match props.get(&PropKey::new("deps")) {
            Some(Value::Object(rc)) => rc.borrow().get(&PropKey::new(name)).cloned(),
            _ => None,
        }
    }

    fn parent_of(&self, class: CreationId) -> Result<Option<CreationId>> {
        let creation = self.heap.get(class);
        let Some(template) = creation.template() else {
            return Ok(None);
        };
        let Some(parent_name) = template.parent() else {
            return Ok(None);
        };
        if let Some(Value::Creation(id)) = self.deps_lookup(class, parent_name) {
            return Ok(Some(id));
        }
        if parent_name == crate::sandbox::NATIVE_JIG || parent_name == crate::sandbox::NATIVE_BERRY
        {
            return Ok(Some(self.native(parent_name)?));
        }
        Err(Self::err(format!(
            "parent {parent_name} is not in deps"
        )))
    }

    /// Walks the inheritance chain from a class to its native root.
    fn class_chain(&self, class: CreationId) -> Result<Vec<CreationId>> {
        let mut chain = vec![class];
        let mut current = class;
        while let Some(parent) = self.parent_of(current)? {
            if chain.contains(&parent) {
                return Err(Self::err("circular class hierarchy"));
            }
            chain.push(parent);
            current = parent;
            if chain.len() > 64 {
                return Err(Self::err("class hierarchy too deep"));
            }
        }
        Ok(chain)
    }

    pub fn extends_native(&self, class: CreationId, ident: &str) -> Result<bool> {
        let native = self.native(ident)?;
        Ok(self.class_chain(class)?.contains(&native))
    }

    fn find_method(
        &self,
        class: CreationId,
        name: &str,
        is_static: bool,
    ) -> Result<Option<(CreationId, MethodDecl)>> {
        for id in self.class_chain(class)? {
            if let Some(template) = self.heap.get(id).template() {
                if let Some(m) = template.method(name, is_static) {
                    return Ok(Some((id, m.clone())));
                }
            }
        }
        Ok(None)
    }

    // ---- entry points ---------------------------------------------------

    /// Invokes a method on a creation: static on code, instance methods
    /// on jigs and berries, function bodies on deployed functions.
    pub fn call_creation_method(
        &mut self,
        target: CreationId,
        method: &str,
        args: &[Value],
        caller: Option<CreationId>,
    ) -> Result<Value> {
        membrane::check_callable(self.heap, target, method)?;

        enum Shape {
            Function(String),
            StaticCode,
            Instance(CreationId),
            Native(String),
        }
        let shape = match &self.heap.get(target).kind {
            CreationKind::Code { template, .. } => {
                if template.is_function() {
                    Shape::Function(template.name.clone())
                } else {
                    Shape::StaticCode
                }
            }
            CreationKind::Jig { class } => Shape::Instance(*class),
            CreationKind::Berry { class, .. } => Shape::Instance(*class),
            CreationKind::Native { ident } => Shape::Native(ident.clone()),
            CreationKind::Pending => {
                return Err(RvmError::internal("method call on a pending shell"));
            }
        };

        let (class, is_static, this) = match shape {
            Shape::Function(name) => {
                if method != name && method != "call" {
                    return Err(Self::err(format!(
                        "{method} is not the deployed function"
                    )));
                }
                return self.call_function_code(target, args, caller);
            }
            Shape::StaticCode => (target, true, Value::Creation(target)),
            Shape::Instance(class) => (class, false, Value::Creation(target)),
            Shape::Native(ident) => {
                return Err(Self::err(format!(
                    "{ident} methods cannot be invoked directly"
                )));
            }
        };

        // Base actions every jig inherits. Berries have no UTXO to spend.
        match method {
            "destroy" => {
                if !self.heap.get(target).rules.bindings {
                    return Err(Self::err("creation cannot be destroyed"));
                }
                self.record.delete(self.heap, target)?;
                self.heap.get_mut(target).bindings.satoshis = 0;
                return Ok(Value::Undefined);
            }
            "auth" => {
                if !self.heap.get(target).rules.bindings {
                    return Err(Self::err("creation cannot be authed"));
                }
                // A forced spend: no state change, but a new location.
                self.record.update(self.heap, target)?;
                return Ok(Value::Undefined);
            }
            "sync" => {
                return Err(Self::err("sync may not be called inside methods"));
            }
            _ => {}
        }

        let Some((defining, decl)) = self.find_method(class, method, is_static)? else {
            return Err(Self::err(format!("{method} is not a method")));
        };

        let env = Scope::root();
        for (i, param) in decl.params.iter().enumerate() {
            Scope::declare(&env, param, args.get(i).cloned().unwrap_or(Value::Undefined));
        }
        let frame = Frame {
            this,
            class: Some(defining),
            caller,
            env,
            owned: Rc::new(RefCell::new(HashMap::new())),
            foreign: Rc::new(RefCell::new(HashSet::new())),
        };
        Ok(self
            .eval_block(&frame, &decl.body)?
            .unwrap_or(Value::Undefined))
    }

    fn call_function_code(
        &mut self,
        target: CreationId,
        args: &[Value],
        caller: Option<CreationId>,
    ) -> Result<Value> {
        let Decl::Function(decl) = self
            .heap
            .get(target)
            .template()
            .map(|t| t.decl.clone())
            .ok_or_else(|| RvmError::internal("function code without template"))?
        else {
            return Err(RvmError::internal("expected function declaration"));
        };
        let env = Scope::root();
        for (i, param) in decl.params.iter().enumerate() {
            Scope::declare(&env, param, args.get(i).cloned().unwrap_or(Value::Undefined));
        }
        let frame = Frame {
            this: Value::Undefined,
            class: Some(target),
            caller,
            env,
            owned: Rc::new(RefCell::new(HashMap::new())),
            foreign: Rc::new(RefCell::new(HashSet::new())),
        };
        Ok(self
            .eval_block(&frame, &decl.body)?
            .unwrap_or(Value::Undefined))
    }

    /// `new Class(args)` at the action level.
    pub fn construct(
        &mut self,
        class: CreationId,
        args: &[Value],
        caller: Option<CreationId>,
    ) -> Result<Value> {
        if !self.heap.get(class).is_code() {
            return Err(Self::err("only classes can be constructed"));
        }
        if self.extends_native(class, crate::sandbox::NATIVE_BERRY)? {
            return self.construct_berry(class, args, caller);
        }
        if !self.extends_native(class, crate::sandbox::NATIVE_JIG)? {
            return self.construct_arb(class, args, caller);
        }

        let instance = self.heap.alloc(Creation::new(
            CreationKind::Jig { class },
            Rules::jig_instance(),
        ));
        self.record.create(instance);
        self.run_init(Value::Creation(instance), class, args, caller)?;
        Ok(Value::Creation(instance))
    }

    fn construct_arb(
        &mut self,
        class: CreationId,
        args: &[Value],
        caller: Option<CreationId>,
    ) -> Result<Value> {
        let value = Value::Arb {
            class,
            props: Rc::new(RefCell::new(Props::new())),
        };
        self.run_init(value.clone(), class, args, caller)?;
        Ok(value)
    }

    fn construct_berry(
        &mut self,
        class: CreationId,
        args: &[Value],
        caller: Option<CreationId>,
    ) -> Result<Value> {
        let path = match &self.pluck {
            Some(p) => p.path.clone(),
            None => {
                return Err(Self::err(
                    "berries can only be constructed during a pluck",
                ));
            }
        };
        // Init runs against a staging object; the berry freezes after.
        let staging = Value::new_object(Props::new());
        self.run_init(staging.clone(), class, args, caller)?;
        let Value::Object(props) = staging else {
            unreachable!()
        };
        let mut berry = Creation::new(CreationKind::Berry { class, path }, Rules::berry());
        berry.props = props;
        let id = self.heap.alloc(berry);
        if let Some(pluck) = &mut self.pluck {
            pluck.created = Some(id);
        }
        Ok(Value::Creation(id))
    }

    fn run_init(
        &mut self,
        this: Value,
        class: CreationId,
        args: &[Value],
        caller: Option<CreationId>,
    ) -> Result<()> {
        let Some((defining, decl)) = self.find_method(class, "init", false)? else {
            if !args.is_empty() {
                return Err(Self::err("class has no init but was given arguments"));
            }
            return Ok(());
        };
        let env = Scope::root();
        for (i, param) in decl.params.iter().enumerate() {
            Scope::declare(&env, param, args.get(i).cloned().unwrap_or(Value::Undefined));
        }
        let frame = Frame {
            this,
            class: Some(defining),
            caller,
            env,
            owned: Rc::new(RefCell::new(HashMap::new())),
            foreign: Rc::new(RefCell::new(HashSet::new())),
        };
        self.eval_block(&frame, &decl.body)?;
        Ok(())
    }

    // ---- statements -----------------------------------------------------

    fn eval_block(&mut self, frame: &Frame, block: &[Stmt]) -> Result<Option<Value>> {
        for stmt in block {
            if let Some(ret) = self.eval_stmt(frame, stmt)? {
                return Ok(Some(ret));
            }
        }
        Ok(None)
    }

    fn eval_stmt(&mut self, frame: &Frame, stmt: &Stmt) -> Result<Option<Value>> {
        self.step()?;
        match stmt {
            Stmt::Let { name, init } => {
                let value = match init {
                    Some(e) => self.eval_expr(frame, e)?,
                    None => Value::Undefined,
                };
                Scope::declare(&frame.env, name, value);
                Ok(None)
            }
            Stmt::Assign { target, op, value } => {
                let value = self.eval_expr(frame, value)?;
                self.assign(frame, target, *op, value)?;
                Ok(None)
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                if self.eval_expr(frame, cond)?.truthy() {
                    self.eval_scoped(frame, then)
                } else if let Some(otherwise) = otherwise {
                    self.eval_scoped(frame, otherwise)
                } else {
                    Ok(None)
                }
            }
            Stmt::While { cond, body } => {
                while self.eval_expr(frame, cond)?.truthy() {
                    self.step()?;
                    if let Some(ret) = self.eval_scoped(frame, body)? {
                        return Ok(Some(ret));
                    }
                }
                Ok(None)
            }
            Stmt::ForOf { name, iter, body } => {
                let iterable = self.eval_expr(frame, iter)?;
                for item in realm::iterate(&iterable)? {
                    self.step()?;
                    let env = Scope::child(&frame.env);
                    Scope::declare(&env, name, item);
                    let inner = Frame {
                        this: frame.this.clone(),
                        class: frame.class,
                        caller: frame.caller,
                        env,
                        owned: frame.owned.clone(),
                        foreign: frame.foreign.clone(),
                    };
                    if let Some(ret) = self.eval_block(&inner, body)? {
                        return Ok(Some(ret));
                    }
                }
                Ok(None)
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(e) => self.eval_expr(frame, e)?,
                    None => Value::Undefined,
                };
                Ok(Some(value))
            }
            Stmt::Throw(value) => {
                let value = self.eval_expr(frame, value)?;
                Err(Self::err(realm::display_string(&value)))
            }
            Stmt::Expr(e) => {
                self.eval_expr(frame, e)?;
                Ok(None)
            }
        }
    }

    fn eval_scoped(&mut self, frame: &Frame, block: &[Stmt]) -> Result<Option<Value>> {
        let inner = Frame {
            this: frame.this.clone(),
            class: frame.class,
            caller: frame.caller,
            env: Scope::child(&frame.env),
            owned: frame.owned.clone(),
            foreign: frame.foreign.clone(),
        };
        self.eval_block(&inner, block)
    }

    // ---- provenance -----------------------------------------------------

    /// Tags a value fetched from a creation or from an already-tagged
    /// container, so that mutation rules follow it.
    fn tag_child(&self, frame: &Frame, parent_ptr: Option<usize>, child: &Value) {
        let Some(ptr) = child.container_ptr() else {
            return;
        };
        if let Some(parent) = parent_ptr {
            if frame.foreign.borrow().contains(&parent) {
                frame.foreign.borrow_mut().insert(ptr);
            }
            let owner = frame.owned.borrow().get(&parent).copied();
            if let Some(owner) = owner {
                frame.owned.borrow_mut().insert(ptr, owner);
            }
        }
    }

    fn tag_from_creation(&self, frame: &Frame, source: CreationId, child: &Value) {
        let Some(ptr) = child.container_ptr() else {
            return;
        };
        if membrane::container_owned(self.heap, Some(&frame.ctx()), source) {
            frame.owned.borrow_mut().insert(ptr, source);
        } else {
            frame.foreign.borrow_mut().insert(ptr);
        }
    }

    /// Gate for any mutation of a container value.
    fn check_mutable(&mut self, frame: &Frame, container: &Value) -> Result<()> {
        let Some(ptr) = container.container_ptr() else {
            return Err(Self::err("value is not a container"));
        };
        if frame.foreign.borrow().contains(&ptr) {
            return Err(Self::err(
                "objects of another creation are immutable here",
            ));
        }
        let owner = frame.owned.borrow().get(&ptr).copied();
        if let Some(owner) = owner {
            self.record.update(self.heap, owner)?;
        }
        Ok(())
    }

    // ---- expressions ----------------------------------------------------

    fn eval_expr(&mut self, frame: &Frame, expr: &Expr) -> Result<Value> {
        self.step()?;
        match expr {
            Expr::Undefined => Ok(Value::Undefined),
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::This => Ok(frame.this.clone()),
            Expr::ArrayLit(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_expr(frame, item)?);
                }
                Ok(Value::new_array(out))
            }
            Expr::ObjectLit(fields) => {
                let mut props = Props::new();
                for (key, value) in fields {
                    props.insert(PropKey::new(key), self.eval_expr(frame, value)?);
                }
                Ok(Value::new_object(props))
            }
            Expr::Ident(name) => self.resolve_ident(frame, name),
            Expr::Member { obj, name } => {
                let value = self.eval_expr(frame, obj)?;
                self.member_get(frame, &value, name)
            }
            Expr::Index { obj, index } => {
                let value = self.eval_expr(frame, obj)?;
                let index = self.eval_expr(frame, index)?;
                self.index_get(frame, &value, &index)
            }
            Expr::Call { callee, args } => self.eval_call(frame, callee, args),
            Expr::New { callee, args } => self.eval_new(frame, callee, args),
            Expr::Arrow(body) => Ok(Value::Closure(Rc::new(Closure {
                params: body.params.clone(),
                body: body.clone(),
                env: frame.env.clone(),
            }))),
            Expr::Unary { op, expr } => {
                let value = self.eval_expr(frame, expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Neg => {
                        let n = realm::as_int(&value)?;
                        n.checked_neg()
                            .map(Value::Int)
                            .ok_or_else(|| Self::err("integer overflow"))
                    }
                    UnaryOp::TypeOf => Ok(Value::Str(value.type_of().into())),
                }
            }
            Expr::Logical { and, lhs, rhs } => {
                let left = self.eval_expr(frame, lhs)?;
                if *and {
                    if !left.truthy() {
                        return Ok(left);
                    }
                } else if left.truthy() {
                    return Ok(left);
                }
                self.eval_expr(frame, rhs)
            }
            Expr::Binary { op, lhs, rhs } => {
                let a = self.eval_expr(frame, lhs)?;
                let b = self.eval_expr(frame, rhs)?;
                match op {
                    BinOp::Add => realm::binary_add(&a, &b),
                    BinOp::Sub => realm::binary_arith("-", &a, &b),
                    BinOp::Mul => realm::binary_arith("*", &a, &b),
                    BinOp::Div => realm::binary_arith("/", &a, &b),
                    BinOp::Mod => realm::binary_arith("%", &a, &b),
                    BinOp::Eq => Ok(Value::Bool(realm::loose_eq(&a, &b))),
                    BinOp::Ne => Ok(Value::Bool(!realm::loose_eq(&a, &b))),
                    BinOp::StrictEq => Ok(Value::Bool(a.strict_eq(&b))),
                    BinOp::StrictNe => Ok(Value::Bool(!a.strict_eq(&b))),
                    BinOp::Lt => Ok(Value::Bool(realm::compare("<", &a, &b)?)),
                    BinOp::Le => Ok(Value::Bool(realm::compare("<=", &a, &b)?)),
                    BinOp::Gt => Ok(Value::Bool(realm::compare(">", &a, &b)?)),
                    BinOp::Ge => Ok(Value::Bool(realm::compare(">=", &a, &b)?)),
                }
            }
        }
    }

    fn resolve_ident(&mut self, frame: &Frame, name: &str) -> Result<Value> {
        if let Some(v) = Scope::lookup(&frame.env, name) {
            return Ok(v);
        }
        if name == "caller" {
            return Ok(match frame.caller {
                Some(id) => Value::Creation(id),
                None => Value::Null,
            });
        }
        if let Some(class) = frame.class {
            if let Some(v) = self.deps_lookup(class, name) {
                return Ok(v);
            }
            if let Some(template) = self.heap.get(class).template() {
                if template.name == name {
                    return Ok(Value::Creation(class));
                }
            }
        }
        if name == crate::sandbox::NATIVE_JIG || name == crate::sandbox::NATIVE_BERRY {
            return Ok(Value::Creation(self.native(name)?));
        }
        if let Some(err) = realm::banned_global(name) {
            return Err(err);
        }
        if NAMESPACES.contains(&name) || name == "Set" || name == "Map" {
            return Err(Self::err(format!("{name} cannot be used as a value")));
        }
        Err(Self::err(format!("{name} is not defined")))
    }

    fn member_get(&mut self, frame: &Frame, obj: &Value, name: &str) -> Result<Value> {
        match obj {
            Value::Creation(id) => {
                let ctx = frame.ctx();
                let value = membrane::get_prop(
                    self.heap,
                    Some(&mut *self.record),
                    Some(&ctx),
                    *id,
                    name,
                )?;
                self.tag_from_creation(frame, *id, &value);
                Ok(value)
            }
            Value::Object(rc) => {
                let value = rc
                    .borrow()
                    .get(&PropKey::new(name))
                    .cloned()
                    .unwrap_or(Value::Undefined);
                self.tag_child(frame, obj.container_ptr(), &value);
                Ok(value)
            }
            Value::Arb { props, .. } => {
                let value = props
                    .borrow()
                    .get(&PropKey::new(name))
                    .cloned()
                    .unwrap_or(Value::Undefined);
                self.tag_child(frame, obj.container_ptr(), &value);
                Ok(value)
            }
            Value::Array(_) | Value::Str(_) | Value::Bytes(_) if name == "length" => {
                Ok(realm::length_of(obj).unwrap_or(Value::Undefined))
            }
            Value::Set(_) | Value::Map(_) if name == "size" => {
                Ok(realm::size_of(obj).unwrap_or(Value::Undefined))
            }
            _ => Ok(Value::Undefined),
        }
    }

    fn index_get(&mut self, frame: &Frame, obj: &Value, index: &Value) -> Result<Value> {
        match obj {
            Value::Array(rc) => {
                let i = realm::as_int(index)?;
                let items = rc.borrow();
                let value = usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Value::Undefined);
                drop(items);
                self.tag_child(frame, obj.container_ptr(), &value);
                Ok(value)
            }
            Value::Bytes(bytes) => {
                let i = realm::as_int(index)?;
                Ok(usize::try_from(i)
                    .ok()
                    .and_then(|i| bytes.get(i).copied())
                    .map(|b| Value::Int(b as i64))
                    .unwrap_or(Value::Undefined))
            }
            Value::Str(s) => {
                let i = realm::as_int(index)?;
                Ok(usize::try_from(i)
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| Value::Str(c.to_string()))
                    .unwrap_or(Value::Undefined))
            }
            Value::Object(_) | Value::Arb { .. } | Value::Creation(_) => {
                let key = realm::display_string(index);
                self.member_get(frame, obj, &key)
            }
            other => Err(Self::err(format!(
                "cannot index into {}",
                other.type_of()
            ))),
        }
    }

    fn assign(&mut self, frame: &Frame, target: &Expr, op: AssignOp, value: Value) -> Result<()> {
        let value = match op {
            AssignOp::Assign => value,
            AssignOp::Add => {
                let current = self.eval_expr(frame, target)?;
                realm::binary_add(&current, &value)?
            }
            AssignOp::Sub => {
                let current = self.eval_expr(frame, target)?;
                realm::binary_arith("-", &current, &value)?
            }
        };
        match target {
            Expr::Ident(name) => {
                if Scope::assign(&frame.env, name, value) {
                    Ok(())
                } else {
                    Err(Self::err(format!(
                        "cannot assign to undeclared {name}"
                    )))
                }
            }
            Expr::Member { obj, name } => {
                let obj = self.eval_expr(frame, obj)?;
                self.member_set(frame, &obj, name, value)
            }
            Expr::Index { obj, index } => {
                let obj = self.eval_expr(frame, obj)?;
                let index = self.eval_expr(frame, index)?;
                self.index_set(frame, &obj, &index, value)
            }
            _ => Err(Self::err("invalid assignment target")),
        }
    }

    fn member_set(&mut self, frame: &Frame, obj: &Value, name: &str, value: Value) -> Result<()> {
        match obj {
            Value::Creation(id) => {
                let ctx = frame.ctx();
                membrane::set_prop(
                    self.heap,
                    self.record,
                    &ctx,
                    *id,
                    name,
                    value,
                    self.backing_limit,
                )
            }
            Value::Object(rc) => {
                self.check_mutable(frame, obj)?;
                rc.borrow_mut().insert(PropKey::new(name), value);
                Ok(())
            }
            Value::Arb { props, .. } => {
                self.check_mutable(frame, obj)?;
                props.borrow_mut().insert(PropKey::new(name), value);
                Ok(())
            }
            other => Err(Self::err(format!(
                "cannot set properties on {}",
                other.type_of()
            ))),
        }
    }

    fn index_set(
        &mut self,
        frame: &Frame,
        obj: &Value,
        index: &Value,
        value: Value,
    ) -> Result<()> {
        match obj {
            Value::Array(rc) => {
                self.check_mutable(frame, obj)?;
                let i = realm::as_int(index)?;
                let i = usize::try_from(i)
                    .map_err(|_| Self::err("negative array index"))?;
                let mut items = rc.borrow_mut();
                match i.cmp(&items.len()) {
                    std::cmp::Ordering::Less => items[i] = value,
                    std::cmp::Ordering::Equal => items.push(value),
                    std::cmp::Ordering::Greater => {
                        return Err(Self::err("sparse arrays are not supported"));
                    }
                }
                Ok(())
            }
            Value::Object(_) | Value::Arb { .. } | Value::Creation(_) => {
                let key = realm::display_string(index);
                self.member_set(frame, obj, &key, value)
            }
            other => Err(Self::err(format!(
                "cannot index into {}",
                other.type_of()
            ))),
        }
    }

    // ---- calls ----------------------------------------------------------

    fn eval_args(&mut self, frame: &Frame, args: &[Expr]) -> Result<Vec<Value>> {
        args.iter().map(|a| self.eval_expr(frame, a)).collect()
    }

    fn eval_call(&mut self, frame: &Frame, callee: &Expr, args: &[Expr]) -> Result<Value> {
        // Namespace calls: Object.keys(x), JSON.stringify(x), Math.abs(x).
        if let Expr::Member { obj, name } = callee {
            if let Expr::Ident(ns) = obj.as_ref() {
                if NAMESPACES.contains(&ns.as_str())
                    && Scope::lookup(&frame.env, ns).is_none()
                {
                    let args = self.eval_args(frame, args)?;
                    return self.namespace_call(frame, ns, name, &args);
                }
            }
            let target = self.eval_expr(frame, obj)?;
            let args = self.eval_args(frame, args)?;
            return self.method_call(frame, &target, name, &args);
        }

        if let Expr::Ident(name) = callee {
            // The pluck-scoped fetch shim.
            if name == "fetch" && Scope::lookup(&frame.env, name).is_none() {
                let fetch = self.pluck.as_ref().map(|p| p.fetch);
                if let Some(fetch) = fetch {
                    let args = self.eval_args(frame, args)?;
                    let txid = match args.first() {
                        Some(Value::Str(s)) => s.clone(),
                        _ => return Err(Self::err("fetch requires a txid string")),
                    };
                    return fetch(&txid);
                }
            }
        }

        let callee_value = self.eval_expr(frame, callee)?;
        let args = self.eval_args(frame, args)?;
        match &callee_value {
            Value::Closure(_) => self.call_closure(frame, &callee_value, &args),
            Value::Creation(id) if self.heap.get(*id).is_code() => {
                let name = match self.heap.get(*id).template() {
                    Some(t) if t.is_function() => t.name.clone(),
                    _ => {
                        return Err(Self::err(
                            "classes must be called with new or via a method",
                        ));
                    }
                };
                self.call_creation_method(*id, &name, &args, frame.this_id())
            }
            other => Err(Self::err(format!("{} is not callable", other.type_of()))),
        }
    }

    fn method_call(
        &mut self,
        frame: &Frame,
        target: &Value,
        name: &str,
        args: &[Value],
    ) -> Result<Value> {
        match target {
            Value::Creation(id) => {
                self.call_creation_method(*id, name, args, frame.this_id())
            }
            Value::Array(rc) => {
                if matches!(name, "push" | "pop" | "reverse" | "sort") {
                    self.check_mutable(frame, target)?;
                }
                match name {
                    "sort" | "map" | "filter" | "forEach" | "find" | "some" | "every" => {
                        // Split borrow: the callback re-enters the
                        // interpreter with the same frame.
                        let rc = rc.clone();
                        let mut invoke = |f: &Value, call_args: &[Value]| {
                            self.call_closure(frame, f, call_args)
                        };
                        realm::array_callback_method(&rc, name, args, &mut invoke)
                    }
                    _ => realm::array_method(rc, name, args),
                }
            }
            Value::Str(s) => realm::string_method(s, name, args),
            Value::Set(rc) => {
                if matches!(name, "add" | "delete" | "clear") {
                    self.check_mutable(frame, target)?;
                }
                realm::set_method(rc, name, args, target)
            }
            Value::Map(rc) => {
                if matches!(name, "set" | "delete" | "clear") {
                    self.check_mutable(frame, target)?;
                }
                realm::map_method(rc, name, args, target)
            }
            Value::Arb { class, .. } => {
                // Sidekick instance methods run without the membrane.
                let Some((defining, decl)) = self.find_method(*class, name, false)? else {
                    return Err(Self::err(format!("{name} is not a method")));
                };
                let env = Scope::root();
                for (i, param) in decl.params.iter().enumerate() {
                    Scope::declare(&env, param, args.get(i).cloned().unwrap_or(Value::Undefined));
                }
                let inner = Frame {
                    this: target.clone(),
                    class: Some(defining),
                    caller: frame.caller,
                    env,
                    owned: frame.owned.clone(),
                    foreign: frame.foreign.clone(),
                };
                Ok(self
                    .eval_block(&inner, &decl.body)?
                    .unwrap_or(Value::Undefined))
            }
            other => Err(Self::err(format!(
                "{} has no method {name}",
                other.type_of()
            ))),
        }
    }

    fn namespace_call(
        &mut self,
        frame: &Frame,
        ns: &str,
        name: &str,
        args: &[Value],
    ) -> Result<Value> {
        match ns {
            "Math" => realm::math_method(name, args),
            "Object" => {
                let target = args.first().cloned().unwrap_or(Value::Undefined);
                let props = self.props_view(frame, &target)?;
                match name {
                    "keys" => Ok(realm::object_keys(&props)),
                    "values" => Ok(realm::object_values(&props)),
                    "entries" => Ok(realm::object_entries(&props)),
                    "assign" => {
                        self.check_mutable(frame, &target)?;
                        let mut merged: Vec<Props> = Vec::new();
                        for source in &args[1..] {
                            merged.push(self.props_view(frame, source)?);
                        }
                        let Value::Object(rc) = &target else {
                            return Err(Self::err("Object.assign target must be an object"));
                        };
                        let mut dest = rc.borrow_mut();
                        for source in merged {
                            for (k, v) in source {
                                dest.insert(k, v);
                            }
                        }
                        drop(dest);
                        Ok(target.clone())
                    }
                    "freeze" => Ok(target),
                    _ => Err(Self::err(format!("unknown Object member {name}"))),
                }
            }
            "JSON" => match name {
                "stringify" => {
                    let target = args.first().cloned().unwrap_or(Value::Undefined);
                    let target = self.apply_to_json_hooks(frame, &target, 0)?;
                    let json = crate::codec::to_plain_json(&target)?;
                    rvm_encoding::to_canonical_string(&json)
                        .map(Value::Str)
                        .map_err(|e| Self::err(e.to_string()))
                }
                "parse" => {
                    let Some(Value::Str(s)) = args.first() else {
                        return Err(Self::err("JSON.parse requires a string"));
                    };
                    let json: serde_json::Value = serde_json::from_str(s)
                        .map_err(|e| Self::err(format!("bad JSON: {e}")))?;
                    crate::codec::from_plain_json(&json)
                }
                _ => Err(Self::err(format!("unknown JSON member {name}"))),
            },
            _ => Err(RvmError::internal(format!("unknown namespace {ns}"))),
        }
    }

    /// Replaces values carrying a `toJSON` method with its result before
    /// stringification, recursively.
    fn apply_to_json_hooks(&mut self, frame: &Frame, v: &Value, depth: usize) -> Result<Value> {
        if depth > 32 {
            return Err(Self::err("toJSON recursion too deep"));
        }
        match v {
            Value::Arb { class, .. } => {
                if self.find_method(*class, "toJSON", false)?.is_some() {
                    let replaced = self.method_call(frame, v, "toJSON", &[])?;
                    return self.apply_to_json_hooks(frame, &replaced, depth + 1);
                }
                Ok(v.clone())
            }
            Value::Array(rc) => {
                let items = rc.borrow().clone();
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    out.push(self.apply_to_json_hooks(frame, item, depth + 1)?);
                }
                Ok(Value::new_array(out))
            }
            Value::Object(rc) => {
                let props = rc.borrow().clone();
                let mut out = Props::new();
                for (k, item) in &props {
                    out.insert(k.clone(), self.apply_to_json_hooks(frame, item, depth + 1)?);
                }
                Ok(Value::new_object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Enumerable own-props of objects, arbs and creations.
    fn props_view(&mut self, frame: &Frame, v: &Value) -> Result<Props> {
        match v {
            Value::Object(rc) => Ok(rc.borrow().clone()),
            Value::Arb { props, .. } => Ok(props.borrow().clone()),
            Value::Creation(id) => {
                if self.heap.get(*id).rules.record_reads {
                    self.record.read(self.heap, *id);
                }
                Ok(self.heap.get(*id).props.borrow().clone())
            }
            other => Err(Self::err(format!(
                "{} has no enumerable properties",
                other.type_of()
            ))),
        }
    }

    fn call_closure(&mut self, frame: &Frame, f: &Value, args: &[Value]) -> Result<Value> {
        let Value::Closure(closure) = f else {
            return Err(Self::err(format!("{} is not a function", f.type_of())));
        };
        self.step()?;
        let env = Scope::child(&closure.env);
        for (i, param) in closure.params.iter().enumerate() {
            Scope::declare(&env, param, args.get(i).cloned().unwrap_or(Value::Undefined));
        }
        let inner = Frame {
            this: frame.this.clone(),
            class: frame.class,
            caller: frame.caller,
            env,
            owned: frame.owned.clone(),
            foreign: frame.foreign.clone(),
        };
        match &closure.body.body {
            ArrowKind::Expr(e) => self.eval_expr(&inner, e),
            ArrowKind::Block(block) => Ok(self
                .eval_block(&inner, block)?
                .unwrap_or(Value::Undefined)),
        }
    }

    fn eval_new(&mut self, frame: &Frame, callee: &Expr, args: &[Expr]) -> Result<Value> {
        if let Expr::Ident(name) = callee {
            if Scope::lookup(&frame.env, name).is_none() {
                match name.as_str() {
                    "Set" => {
                        let set = Value::new_set();
                        if let Some(arg) = args.first() {
                            let iterable = self.eval_expr(frame, arg)?;
                            let Value::Set(rc) = &set else { unreachable!() };
                            for item in realm::iterate(&iterable)? {
                                let mut items = rc.borrow_mut();
                                if !items.iter().any(|x| x.strict_eq(&item)) {
                                    items.push(item);
                                }
                            }
                        }
                        return Ok(set);
                    }
                    "Map" => {
                        let map = Value::new_map();
                        if let Some(arg) = args.first() {
                            let iterable = self.eval_expr(frame, arg)?;
                            let Value::Map(rc) = &map else { unreachable!() };
                            for pair in realm::iterate(&iterable)? {
                                let Value::Array(pair_rc) = &pair else {
                                    return Err(Self::err("Map requires [key, value] pairs"));
                                };
                                let pair_items = pair_rc.borrow();
                                let key = pair_items.first().cloned().unwrap_or(Value::Undefined);
                                let value = pair_items.get(1).cloned().unwrap_or(Value::Undefined);
                                rc.borrow_mut().push((key, value));
                            }
                        }
                        return Ok(map);
                    }
                    _ => {}
                }
            }
        }
        let callee_value = self.eval_expr(frame, callee)?;
        let args = self.eval_args(frame, args)?;
        match callee_value {
            Value::Creation(class) => self.construct(class, &args, frame.this_id()),
            other => Err(Self::err(format!(
                "{} is not constructible",
                other.type_of()
            ))),
        }
    }
}
