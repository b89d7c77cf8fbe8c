use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{Result, bail};

use crate::annotated_type::{AnnotatedType, TypeKind};
use crate::dataflow::expression::FlowExpr;
use crate::dataflow::transfer::FlowValues;
use crate::defaults::{DefaultSet, TypeUseLocation};
use crate::dependent::{ExpressionContext, ExpressionMode, Standardized, standardize};
use crate::hierarchy::ArgumentKind;
use crate::ir::{
    ANNOTATED_FOR, Annotation, Class, CompilationUnit, ContractKind, Expr, ExprKind, Field,
    Literal, Method, Param, Stmt, StmtKind, StubFile, TypeParam, TypeSyntax, UnaryOp,
};
use crate::options::CheckerOptions;
use crate::qualifier::{KindId, Qualifier, QualifierArg, QualifierSet};
use crate::type_system::TypeSystem;

/// A class known to the factory, from source or from a stub overlay.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ClassEntry<'a> {
    pub(crate) class: &'a Class,
    pub(crate) from_stub: bool,
}

/// Declared local variable of a method body.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LocalInfo<'a> {
    pub(crate) ty: &'a TypeSyntax,
    pub(crate) location: TypeUseLocation,
    pub(crate) is_final: bool,
}

/// Names visible while typing the expressions of one method body.
#[derive(Clone, Debug)]
pub(crate) struct MethodScope<'a> {
    pub(crate) class: &'a Class,
    pub(crate) method: Option<&'a Method>,
    locals: BTreeMap<&'a str, LocalInfo<'a>>,
}

impl<'a> MethodScope<'a> {
    pub(crate) fn new(class: &'a Class, method: &'a Method) -> Self {
        let mut locals = BTreeMap::new();
        if let Some(body) = method.body.as_ref() {
            collect_locals(body, &mut locals);
        }
        Self {
            class,
            method: Some(method),
            locals,
        }
    }

    /// Scope of field initializers.
    pub(crate) fn for_class(class: &'a Class) -> Self {
        Self {
            class,
            method: None,
            locals: BTreeMap::new(),
        }
    }

    pub(crate) fn local(&self, name: &str) -> Option<LocalInfo<'a>> {
        self.locals.get(name).copied()
    }

    pub(crate) fn param(&self, name: &str) -> Option<&'a Param> {
        self.method?.params.iter().find(|param| param.name == name)
    }

    /// Locals and parameters declared `final`.
    pub(crate) fn final_locals(&self) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self
            .locals
            .iter()
            .filter(|(_, info)| info.is_final)
            .map(|(name, _)| name.to_string())
            .collect();
        if let Some(method) = self.method {
            out.extend(
                method
                    .params
                    .iter()
                    .filter(|param| param.is_final)
                    .map(|param| param.name.clone()),
            );
        }
        out
    }

    fn local_names(&self) -> BTreeSet<String> {
        self.locals.keys().map(|name| name.to_string()).collect()
    }

    /// Parameters as the body refers to them.
    pub(crate) fn param_exprs(&self) -> Vec<FlowExpr> {
        self.method
            .map(|method| {
                method
                    .params
                    .iter()
                    .map(|param| FlowExpr::Local(param.name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn collect_locals<'a>(stmts: &'a [Stmt], out: &mut BTreeMap<&'a str, LocalInfo<'a>>) {
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::LocalVar {
                name, ty, is_final, ..
            } => {
                out.entry(name.as_str()).or_insert(LocalInfo {
                    ty,
                    location: TypeUseLocation::LocalVariable,
                    is_final: *is_final,
                });
            }
            StmtKind::If {
                then_branch,
                else_branch,
                ..
            } => {
                collect_locals(then_branch, out);
                if let Some(else_branch) = else_branch {
                    collect_locals(else_branch, out);
                }
            }
            StmtKind::While { body, .. } | StmtKind::DoWhile { body, .. } => {
                collect_locals(body, out)
            }
            StmtKind::For { init, body, .. } => {
                collect_locals(init, out);
                collect_locals(body, out);
            }
            StmtKind::Try {
                body,
                catches,
                finally,
            } => {
                collect_locals(body, out);
                for catch in catches {
                    out.entry(catch.name.as_str()).or_insert(LocalInfo {
                        ty: &catch.ty,
                        location: TypeUseLocation::ExceptionParameter,
                        is_final: false,
                    });
                    collect_locals(&catch.body, out);
                }
                if let Some(finally) = finally {
                    collect_locals(finally, out);
                }
            }
            StmtKind::Block(stmts) => collect_locals(stmts, out),
            StmtKind::Expr(_)
            | StmtKind::Return(_)
            | StmtKind::Throw(_)
            | StmtKind::Break
            | StmtKind::Continue => {}
        }
    }
}

/// Declared signature of a method, before any call-site adaptation.
#[derive(Clone, Debug)]
pub(crate) struct MethodType {
    pub(crate) receiver: Option<AnnotatedType>,
    pub(crate) params: Vec<AnnotatedType>,
    pub(crate) return_type: AnnotatedType,
}

/// Signature of one invocation, viewpoint-adapted to the call site.
#[derive(Clone, Debug)]
pub(crate) struct MethodSignature<'a> {
    pub(crate) owner: &'a Class,
    pub(crate) method: &'a Method,
    pub(crate) receiver: Option<AnnotatedType>,
    pub(crate) params: Vec<AnnotatedType>,
    pub(crate) return_type: AnnotatedType,
    /// Receiver and arguments as flow expressions, for contract adaptation.
    pub(crate) receiver_expr: FlowExpr,
    pub(crate) arg_exprs: Vec<FlowExpr>,
}

/// A pre- or postcondition with its expression in declaration form.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedContract {
    pub(crate) kind: ContractKind,
    pub(crate) target: FlowExpr,
    pub(crate) expression: String,
    pub(crate) qualifier: Qualifier,
}

/// Everything needed to resolve defaults and dependent expressions at one type use.
struct TypeContext<'s> {
    class: &'s Class,
    method: Option<&'s Method>,
    mode: ExpressionMode,
    locals: BTreeSet<String>,
    scopes: Vec<DefaultSet>,
    unchecked: bool,
}

/// Derives annotated types for declarations and expressions of one type system.
pub(crate) struct AnnotatedTypeFactory<'a> {
    pub(crate) system: &'a TypeSystem,
    pub(crate) options: &'a CheckerOptions,
    classes: BTreeMap<&'a str, ClassEntry<'a>>,
}

impl<'a> AnnotatedTypeFactory<'a> {
    /// Source classes win over stub classes of the same name.
    pub(crate) fn new(
        system: &'a TypeSystem,
        units: &'a [CompilationUnit],
        stubs: &'a [StubFile],
        options: &'a CheckerOptions,
    ) -> Self {
        let mut classes = BTreeMap::new();
        for stub in stubs {
            for class in &stub.classes {
                classes.insert(
                    class.name.as_str(),
                    ClassEntry {
                        class,
                        from_stub: true,
                    },
                );
            }
        }
        for unit in units {
            for class in &unit.classes {
                classes.insert(
                    class.name.as_str(),
                    ClassEntry {
                        class,
                        from_stub: false,
                    },
                );
            }
        }
        Self {
            system,
            options,
            classes,
        }
    }

    pub(crate) fn class(&self, name: &str) -> Option<ClassEntry<'a>> {
        self.classes.get(name).copied()
    }

    /// Supertypes in breadth-first order, excluding the class itself.
    pub(crate) fn supertypes(&self, class: &'a Class) -> Vec<&'a Class> {
        let mut result = Vec::new();
        let mut visited = BTreeSet::from([class.name.as_str()]);
        let mut queue: VecDeque<&'a Class> = VecDeque::from([class]);
        while let Some(current) = queue.pop_front() {
            let parents = current
                .super_name
                .iter()
                .chain(current.interfaces.iter());
            for parent in parents {
                if !visited.insert(parent.as_str()) {
                    continue;
                }
                if let Some(entry) = self.class(parent) {
                    result.push(entry.class);
                    queue.push_back(entry.class);
                }
            }
        }
        result
    }

    /// Method by name and arity in `class_name` or its supertypes.
    pub(crate) fn find_method(
        &self,
        class_name: &str,
        name: &str,
        arity: usize,
    ) -> Option<(&'a Class, &'a Method)> {
        let class = self.class(class_name)?.class;
        std::iter::once(class)
            .chain(self.supertypes(class))
            .find_map(|candidate| {
                candidate
                    .methods
                    .iter()
                    .find(|method| method.name == name && method.params.len() == arity)
                    .map(|method| (candidate, method))
            })
    }

    pub(crate) fn find_field(&self, class_name: &str, name: &str) -> Option<(&'a Class, &'a Field)> {
        let class = self.class(class_name)?.class;
        std::iter::once(class)
            .chain(self.supertypes(class))
            .find_map(|candidate| candidate.field(name).map(|field| (candidate, field)))
    }

    /// Whether `name` read through `receiver` resolves to a final field of
    /// the receiver's class or one of its supertypes.
    pub(crate) fn is_final_field(
        &self,
        receiver: &FlowExpr,
        name: &str,
        scope: &MethodScope<'_>,
    ) -> bool {
        let owner = match receiver {
            FlowExpr::ClassName(owner) => owner.clone(),
            _ => match self.declared_type_of(receiver, scope).map(|ty| ty.kind) {
                Some(TypeKind::Declared { name, .. }) => name,
                _ => return false,
            },
        };
        self.find_field(&owner, name)
            .is_some_and(|(_, field)| field.is_final)
    }

    /// Whether conservative defaults apply to code of `class`.
    pub(crate) fn is_unchecked(&self, class: &Class) -> bool {
        let from_stub = self
            .class(&class.name)
            .is_some_and(|entry| entry.from_stub);
        if from_stub {
            return self.options.conservative_bytecode_defaults;
        }
        self.options.conservative_defaults && !self.is_annotated_for(class)
    }

    fn is_annotated_for(&self, class: &Class) -> bool {
        class.annotations.iter().any(|annotation| {
            annotation.name == ANNOTATED_FOR
                && annotation
                    .values
                    .iter()
                    .any(|value| value == &self.system.name)
        })
    }

    fn context<'s>(
        &self,
        class: &'s Class,
        method: Option<&'s Method>,
        mode: ExpressionMode,
        locals: BTreeSet<String>,
    ) -> TypeContext<'s> {
        let hierarchy = &self.system.hierarchy;
        let mut scopes = Vec::new();
        if let Some(method) = method {
            scopes.push(DefaultSet::from_annotations(&method.annotations, hierarchy));
        }
        scopes.push(DefaultSet::from_annotations(&class.annotations, hierarchy));
        TypeContext {
            class,
            method,
            mode,
            locals,
            scopes,
            unchecked: self.is_unchecked(class),
        }
    }

    fn declaration_context<'s>(&self, class: &'s Class, method: Option<&'s Method>) -> TypeContext<'s> {
        self.context(class, method, ExpressionMode::Declaration, BTreeSet::new())
    }

    fn use_context<'s>(&self, scope: &MethodScope<'s>) -> TypeContext<'s> {
        self.context(scope.class, scope.method, ExpressionMode::Use, scope.local_names())
    }

    fn expression_context(&self, ctx: &TypeContext<'_>) -> ExpressionContext {
        let params: Vec<String> = ctx
            .method
            .map(|method| method.params.iter().map(|param| param.name.clone()).collect())
            .unwrap_or_default();
        let mut fields: BTreeSet<String> =
            ctx.class.fields.iter().map(|field| field.name.clone()).collect();
        if let Some(entry) = self.class(&ctx.class.name) {
            for supertype in self.supertypes(entry.class) {
                fields.extend(supertype.fields.iter().map(|field| field.name.clone()));
            }
        }
        match ctx.mode {
            ExpressionMode::Declaration => ExpressionContext::declaration(params, fields),
            ExpressionMode::Use => ExpressionContext::use_site(params, ctx.locals.clone(), fields),
        }
    }

    fn default_for(&self, location: TypeUseLocation, top: KindId, ctx: &TypeContext<'_>) -> Qualifier {
        let scopes: Vec<&DefaultSet> = ctx.scopes.iter().collect();
        self.system.defaults.resolve(
            &self.system.hierarchy,
            location,
            top,
            &scopes,
            ctx.unchecked,
        )
    }

    fn fill_defaults(&self, qualifiers: &mut QualifierSet, location: TypeUseLocation, ctx: &TypeContext<'_>) {
        for top in self.tops() {
            if qualifiers.get(top).is_none() {
                qualifiers.replace(self.default_for(location, top, ctx));
            }
        }
    }

    fn tops(&self) -> Vec<KindId> {
        self.system.hierarchy.kinds().tops().to_vec()
    }

    /// Qualifier denoted by an annotation, or `None` for foreign annotations.
    ///
    /// An argument that fails to parse yields the hierarchy bottom.
    fn qualifier_from_annotation(&self, annotation: &Annotation, ctx: &TypeContext<'_>) -> Option<Qualifier> {
        let hierarchy = &self.system.hierarchy;
        let kind = hierarchy.kinds().by_name(&annotation.name)?;
        let info = hierarchy.kinds().kind(kind);
        let Some(arguments) = info.arguments else {
            return Some(hierarchy.of_kind(kind));
        };
        match self.annotation_args(annotation, arguments, ctx) {
            Ok(args) => Some(hierarchy.with_args(kind, args)),
            Err(_) => Some(hierarchy.bottom_of(info.top)),
        }
    }

    fn annotation_args(
        &self,
        annotation: &Annotation,
        arguments: ArgumentKind,
        ctx: &TypeContext<'_>,
    ) -> std::result::Result<BTreeSet<QualifierArg>, (String, String)> {
        let mut args = BTreeSet::new();
        match arguments {
            ArgumentKind::Strings => {
                args.extend(annotation.values.iter().cloned().map(QualifierArg::Text));
            }
            ArgumentKind::Ints => {
                for value in &annotation.values {
                    let parsed: i64 = value
                        .trim()
                        .parse()
                        .map_err(|_| (value.clone(), "not an integer".to_string()))?;
                    args.insert(QualifierArg::Int(parsed));
                }
            }
            ArgumentKind::Expressions => {
                let context = self.expression_context(ctx);
                for value in &annotation.values {
                    match standardize(value, &context) {
                        Standardized::Ok(expr) => {
                            args.insert(QualifierArg::Expr(expr));
                        }
                        Standardized::ParseError {
                            expression,
                            message,
                        } => return Err((expression, message)),
                    }
                }
            }
        }
        Ok(args)
    }

    fn explicit_qualifiers(&self, annotations: &[Annotation], ctx: &TypeContext<'_>) -> QualifierSet {
        annotations
            .iter()
            .filter_map(|annotation| self.qualifier_from_annotation(annotation, ctx))
            .collect()
    }

    fn from_syntax(&self, syntax: &TypeSyntax, location: TypeUseLocation, ctx: &TypeContext<'_>) -> AnnotatedType {
        let explicit = self.explicit_qualifiers(syntax.annotations(), ctx);
        let kind = match syntax {
            TypeSyntax::Primitive { name, .. } => TypeKind::Primitive(name.clone()),
            TypeSyntax::Declared { name, args, .. } => TypeKind::Declared {
                name: name.clone(),
                args: args
                    .iter()
                    .map(|arg| self.from_syntax(arg, TypeUseLocation::Otherwise, ctx))
                    .collect(),
            },
            TypeSyntax::Array { component, .. } => TypeKind::Array(Box::new(self.from_syntax(
                component,
                TypeUseLocation::Otherwise,
                ctx,
            ))),
            TypeSyntax::TypeVar { name, .. } => {
                let (upper, lower) = self.type_var_bounds(name, ctx, 0);
                TypeKind::TypeVar {
                    name: name.clone(),
                    upper,
                    lower,
                }
            }
            TypeSyntax::Wildcard {
                extends,
                super_bound,
                ..
            } => TypeKind::Wildcard {
                extends: extends.as_ref().map(|bound| {
                    Box::new(self.from_syntax(bound, TypeUseLocation::ExplicitUpperBound, ctx))
                }),
                super_bound: super_bound.as_ref().map(|bound| {
                    Box::new(self.from_syntax(bound, TypeUseLocation::LowerBound, ctx))
                }),
            },
            TypeSyntax::Intersection { bounds } => TypeKind::Intersection(
                bounds
                    .iter()
                    .map(|bound| self.from_syntax(bound, TypeUseLocation::ExplicitUpperBound, ctx))
                    .collect(),
            ),
            TypeSyntax::Void => TypeKind::Void,
        };
        let mut ty = AnnotatedType::with_qualifiers(kind, explicit);
        if matches!(
            ty.kind,
            TypeKind::Primitive(_) | TypeKind::Declared { .. } | TypeKind::Array(_)
        ) {
            self.fill_defaults(&mut ty.qualifiers, location, ctx);
        }
        ty
    }

    fn type_param<'s>(&self, name: &str, ctx: &TypeContext<'s>) -> Option<&'s TypeParam> {
        ctx.method
            .and_then(|method| method.type_params.iter().find(|param| param.name == name))
            .or_else(|| ctx.class.type_params.iter().find(|param| param.name == name))
    }

    /// Upper and lower bound qualifiers of a type variable in scope.
    fn type_var_bounds(&self, name: &str, ctx: &TypeContext<'_>, depth: usize) -> (QualifierSet, QualifierSet) {
        let hierarchy = &self.system.hierarchy;
        let Some(param) = self.type_param(name, ctx) else {
            return (hierarchy.top_set(), hierarchy.bottom_set());
        };
        let upper = match param.bound.as_ref() {
            Some(bound) => self.bound_qualifiers(bound, ctx, depth),
            None => {
                let mut upper = QualifierSet::new();
                self.fill_defaults(&mut upper, TypeUseLocation::ImplicitUpperBound, ctx);
                upper
            }
        };
        let mut lower = self.explicit_qualifiers(&param.annotations, ctx);
        self.fill_defaults(&mut lower, TypeUseLocation::LowerBound, ctx);
        (upper, lower)
    }

    /// Primary qualifiers of an explicit bound, without building its structure.
    fn bound_qualifiers(&self, bound: &TypeSyntax, ctx: &TypeContext<'_>, depth: usize) -> QualifierSet {
        let mut qualifiers = self.explicit_qualifiers(bound.annotations(), ctx);
        if let TypeSyntax::TypeVar { name, .. } = bound {
            if depth < 8 {
                let (upper, _) = self.type_var_bounds(name, ctx, depth + 1);
                qualifiers.add_all_missing(&upper);
            }
        }
        self.fill_defaults(&mut qualifiers, TypeUseLocation::ExplicitUpperBound, ctx);
        qualifiers
    }

    /// Bound used to capture wildcard arguments of `param`.
    fn declared_bound(&self, param: &TypeParam, ctx: &TypeContext<'_>) -> AnnotatedType {
        match param.bound.as_ref() {
            Some(bound) => self.from_syntax(bound, TypeUseLocation::ExplicitUpperBound, ctx),
            None => {
                let mut object = AnnotatedType::declared("Object", Vec::new());
                self.fill_defaults(
                    &mut object.qualifiers,
                    TypeUseLocation::ImplicitUpperBound,
                    ctx,
                );
                object
            }
        }
    }

    /// Wildcard capture: `?` and `? super B` take the declared bound,
    /// `? extends B` takes `glb(B, bound)` per hierarchy.
    fn capture(&self, arg: &AnnotatedType, param: &TypeParam, owner: &Class) -> Result<AnnotatedType> {
        let TypeKind::Wildcard { extends, .. } = &arg.kind else {
            return Ok(arg.clone());
        };
        let ctx = self.declaration_context(owner, None);
        let bound = self.declared_bound(param, &ctx);
        match extends {
            None => Ok(bound),
            Some(extends) => {
                let mut captured = extends.as_ref().clone();
                let merged = self
                    .system
                    .hierarchy
                    .glb_set(&extends.effective_qualifiers(), &bound.effective_qualifiers())?;
                captured.replace_qualifiers(&merged);
                Ok(captured)
            }
        }
    }

    /// Declared upper bound of each type parameter of `class_name`.
    pub(crate) fn type_parameter_bounds(&self, class_name: &str) -> Vec<(String, AnnotatedType)> {
        let Some(entry) = self.class(class_name) else {
            return Vec::new();
        };
        let ctx = self.declaration_context(entry.class, None);
        entry
            .class
            .type_params
            .iter()
            .map(|param| (param.name.clone(), self.declared_bound(param, &ctx)))
            .collect()
    }

    /// Mapping from `owner`'s type parameters to the receiver's captured arguments.
    fn class_substitution(
        &self,
        owner: &Class,
        receiver: &AnnotatedType,
    ) -> Result<BTreeMap<String, AnnotatedType>> {
        let mut mapping = BTreeMap::new();
        if !receiver.is_declared(&owner.name) {
            return Ok(mapping);
        }
        for (param, arg) in owner.type_params.iter().zip(receiver.type_args()) {
            mapping.insert(param.name.clone(), self.capture(arg, param, owner)?);
        }
        Ok(mapping)
    }

    pub(crate) fn field_type(&self, owner: &Class, field: &Field) -> AnnotatedType {
        let ctx = self.declaration_context(owner, None);
        self.from_syntax(&field.ty, TypeUseLocation::Field, &ctx)
    }

    /// Declared signature in the declaration context of `owner`.
    pub(crate) fn method_type(&self, owner: &Class, method: &Method) -> MethodType {
        let ctx = self.declaration_context(owner, Some(method));
        let params = method
            .params
            .iter()
            .map(|param| self.from_syntax(&param.ty, TypeUseLocation::Parameter, &ctx))
            .collect();
        let return_type = if method.is_constructor() {
            let mut ty = self.class_type(owner, &ctx);
            ty.clear_primary();
            ty.replace_qualifiers(&self.explicit_qualifiers(method.return_type.annotations(), &ctx));
            self.fill_defaults(&mut ty.qualifiers, TypeUseLocation::ConstructorResult, &ctx);
            ty
        } else {
            self.from_syntax(&method.return_type, TypeUseLocation::Return, &ctx)
        };
        let receiver = method
            .receiver
            .as_ref()
            .map(|receiver| self.from_syntax(receiver, TypeUseLocation::Receiver, &ctx));
        MethodType {
            receiver,
            params,
            return_type,
        }
    }

    fn class_type(&self, class: &Class, ctx: &TypeContext<'_>) -> AnnotatedType {
        let args = class
            .type_params
            .iter()
            .map(|param| {
                self.from_syntax(
                    &TypeSyntax::TypeVar {
                        name: param.name.clone(),
                        annotations: Vec::new(),
                    },
                    TypeUseLocation::Otherwise,
                    ctx,
                )
            })
            .collect();
        AnnotatedType::declared(&class.name, args)
    }

    /// Type of `this` inside the scope's method.
    pub(crate) fn this_type(&self, scope: &MethodScope<'_>) -> AnnotatedType {
        let ctx = self.use_context(scope);
        let mut ty = self.class_type(scope.class, &ctx);
        if let Some(receiver) = scope.method.and_then(|method| method.receiver.as_ref()) {
            ty.replace_qualifiers(&self.explicit_qualifiers(receiver.annotations(), &ctx));
        }
        self.fill_defaults(&mut ty.qualifiers, TypeUseLocation::Receiver, &ctx);
        ty
    }

    /// Type of a declared local or parameter as seen from inside the body.
    pub(crate) fn variable_type(&self, scope: &MethodScope<'_>, name: &str) -> Option<AnnotatedType> {
        let ctx = self.use_context(scope);
        if let Some(local) = scope.local(name) {
            return Some(self.from_syntax(local.ty, local.location, &ctx));
        }
        scope
            .param(name)
            .map(|param| self.from_syntax(&param.ty, TypeUseLocation::Parameter, &ctx))
    }

    /// Any syntax in the use context of a method body, such as a cast target.
    pub(crate) fn type_in_body(&self, scope: &MethodScope<'_>, syntax: &TypeSyntax) -> AnnotatedType {
        let ctx = self.use_context(scope);
        self.from_syntax(syntax, TypeUseLocation::Otherwise, &ctx)
    }

    fn unknown_type(&self) -> AnnotatedType {
        AnnotatedType::with_qualifiers(
            TypeKind::Declared {
                name: "Object".to_string(),
                args: Vec::new(),
            },
            self.system.hierarchy.top_set(),
        )
    }

    fn boolean_type(&self, ctx: &TypeContext<'_>) -> AnnotatedType {
        let mut ty = AnnotatedType::new(TypeKind::Primitive("boolean".to_string()));
        self.fill_defaults(&mut ty.qualifiers, TypeUseLocation::Otherwise, ctx);
        ty
    }

    pub(crate) fn literal_type(&self, literal: &Literal, scope: &MethodScope<'_>) -> AnnotatedType {
        let ctx = self.use_context(scope);
        let kind = match literal {
            Literal::Null => TypeKind::Null,
            Literal::String(_) => TypeKind::Declared {
                name: "String".to_string(),
                args: Vec::new(),
            },
            Literal::Int(_) => TypeKind::Primitive("int".to_string()),
            Literal::Bool(_) => TypeKind::Primitive("boolean".to_string()),
            Literal::Char(_) => TypeKind::Primitive("char".to_string()),
        };
        let mut qualifiers = self.system.literal_qualifiers(literal);
        for top in self.tops() {
            if qualifiers.get(top).is_none() {
                let fallback = if matches!(literal, Literal::Null) {
                    self.system.hierarchy.bottom_of(top)
                } else {
                    self.default_for(TypeUseLocation::Otherwise, top, &ctx)
                };
                qualifiers.replace(fallback);
            }
        }
        AnnotatedType::with_qualifiers(kind, qualifiers)
    }

    /// Annotated type of `expr`: declared and defaulted type, implicit rules,
    /// and, when `flow` holds a value for the expression, its refinement.
    pub(crate) fn annotated_type(
        &self,
        expr: &Expr,
        scope: &MethodScope<'_>,
        flow: Option<&dyn FlowValues>,
    ) -> Result<AnnotatedType> {
        let mut ty = self.unrefined_type(expr, scope, flow)?;
        if let Some(value) = flow.and_then(|flow| flow.value(expr.id)) {
            apply_refinement(&mut ty, value);
        }
        Ok(ty)
    }

    pub(crate) fn unrefined_type(
        &self,
        expr: &Expr,
        scope: &MethodScope<'_>,
        flow: Option<&dyn FlowValues>,
    ) -> Result<AnnotatedType> {
        let hierarchy = &self.system.hierarchy;
        let ctx = self.use_context(scope);
        let ty = match &expr.kind {
            ExprKind::Literal(literal) => self.literal_type(literal, scope),
            ExprKind::Local(name) => match self.variable_type(scope, name) {
                Some(ty) => ty,
                None => match self.find_field(&scope.class.name, name) {
                    Some((owner, field)) => self.field_type(owner, field),
                    None => bail!(
                        "unknown variable {name} in {}.{}",
                        scope.class.name,
                        scope.method.map(|method| method.name.as_str()).unwrap_or("<init>")
                    ),
                },
            },
            ExprKind::This => self.this_type(scope),
            ExprKind::ClassName(name) => AnnotatedType::declared(name, Vec::new()),
            ExprKind::Field { receiver, name } => {
                let receiver_type = match receiver {
                    Some(receiver) => self.annotated_type(receiver, scope, flow)?,
                    None => self.this_type(scope),
                };
                let receiver_expr = match receiver {
                    Some(receiver) => FlowExpr::from_tree(receiver).unwrap_or(FlowExpr::Unknown),
                    None => FlowExpr::This,
                };
                self.member_field_type(&receiver_type, &receiver_expr, name, &ctx)?
            }
            ExprKind::ArrayAccess { array, .. } => {
                let array_type = self.annotated_type(array, scope, flow)?;
                match array_type.component() {
                    Some(component) => component.clone(),
                    None => self.unknown_type(),
                }
            }
            ExprKind::Call { .. } => match self.method_signature(expr, scope, flow)? {
                Some(signature) => signature.return_type,
                None => self.unknown_type(),
            },
            ExprKind::New {
                class, type_args, ..
            } => {
                let args = type_args
                    .iter()
                    .map(|arg| self.from_syntax(arg, TypeUseLocation::Otherwise, &ctx))
                    .collect();
                let mut ty = AnnotatedType::declared(class, args);
                if let Some((owner, constructor)) = self.find_constructor(expr) {
                    let declared = self.method_type(owner, constructor).return_type;
                    ty.replace_qualifiers(&declared.qualifiers);
                }
                self.fill_defaults(&mut ty.qualifiers, TypeUseLocation::ConstructorResult, &ctx);
                ty
            }
            ExprKind::NewArray { component, .. } => {
                let component = self.from_syntax(component, TypeUseLocation::Otherwise, &ctx);
                let mut ty = AnnotatedType::new(TypeKind::Array(Box::new(component)));
                self.fill_defaults(&mut ty.qualifiers, TypeUseLocation::ConstructorResult, &ctx);
                ty
            }
            ExprKind::Assign { value, .. } => self.annotated_type(value, scope, flow)?,
            ExprKind::Binary { op, left, right } => {
                if op.is_comparison() || op.is_logical() {
                    self.boolean_type(&ctx)
                } else {
                    let left = self.annotated_type(left, scope, flow)?;
                    let right = self.annotated_type(right, scope, flow)?;
                    let kind = if is_string(&left) || is_string(&right) {
                        TypeKind::Declared {
                            name: "String".to_string(),
                            args: Vec::new(),
                        }
                    } else if left.is_primitive() {
                        left.kind.clone()
                    } else {
                        TypeKind::Primitive("int".to_string())
                    };
                    let left = left.effective_qualifiers();
                    let right = right.effective_qualifiers();
                    let mut qualifiers = match self.system.rules.binary(hierarchy, *op, &left, &right) {
                        Some(qualifiers) => qualifiers,
                        None => hierarchy.lub_set(&left, &right)?,
                    };
                    self.fill_defaults(&mut qualifiers, TypeUseLocation::Otherwise, &ctx);
                    AnnotatedType::with_qualifiers(kind, qualifiers)
                }
            }
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Not => self.boolean_type(&ctx),
                UnaryOp::Neg => self.annotated_type(operand, scope, flow)?,
            },
            ExprKind::InstanceOf { .. } => self.boolean_type(&ctx),
            ExprKind::Cast { ty, expr: inner } => {
                let inner = self.annotated_type(inner, scope, flow)?;
                let mut cast = self.from_syntax(ty, TypeUseLocation::Otherwise, &ctx);
                cast.qualifiers = inner.effective_qualifiers();
                cast.replace_qualifiers(&self.explicit_qualifiers(ty.annotations(), &ctx));
                self.fill_defaults(&mut cast.qualifiers, TypeUseLocation::Otherwise, &ctx);
                cast
            }
            ExprKind::Conditional {
                then_expr,
                else_expr,
                ..
            } => {
                let then_type = self.annotated_type(then_expr, scope, flow)?;
                let else_type = self.annotated_type(else_expr, scope, flow)?;
                let mut ty = then_type.clone();
                ty.qualifiers = hierarchy.lub_set(
                    &then_type.effective_qualifiers(),
                    &else_type.effective_qualifiers(),
                )?;
                ty
            }
        };
        Ok(ty)
    }

    /// Field type seen through `receiver_type`, with `this` in dependent
    /// qualifiers replaced by the receiver.
    fn member_field_type(
        &self,
        receiver_type: &AnnotatedType,
        receiver_expr: &FlowExpr,
        name: &str,
        ctx: &TypeContext<'_>,
    ) -> Result<AnnotatedType> {
        if name == "length" && receiver_type.component().is_some() {
            let mut ty = AnnotatedType::new(TypeKind::Primitive("int".to_string()));
            self.fill_defaults(&mut ty.qualifiers, TypeUseLocation::Otherwise, ctx);
            return Ok(ty);
        }
        let TypeKind::Declared {
            name: class_name, ..
        } = &receiver_type.kind
        else {
            return Ok(self.unknown_type());
        };
        let Some((owner, field)) = self.find_field(class_name, name) else {
            return Ok(self.unknown_type());
        };
        let mapping = self.class_substitution(owner, receiver_type)?;
        let declared = self.field_type(owner, field).substitute(&mapping);
        Ok(declared.map_qualifiers(&|qualifier| {
            qualifier.map_exprs(&|expr| expr.viewpoint_adapt(receiver_expr, &[]))
        }))
    }

    fn find_constructor(&self, expr: &Expr) -> Option<(&'a Class, &'a Method)> {
        let ExprKind::New { class, args, .. } = &expr.kind else {
            return None;
        };
        let owner = self.class(class)?.class;
        owner
            .methods
            .iter()
            .find(|method| method.is_constructor() && method.params.len() == args.len())
            .map(|method| (owner, method))
    }

    /// Resolve and viewpoint-adapt the method invoked by a call or `new` expression.
    pub(crate) fn method_signature(
        &self,
        expr: &Expr,
        scope: &MethodScope<'_>,
        flow: Option<&dyn FlowValues>,
    ) -> Result<Option<MethodSignature<'a>>> {
        let (receiver_type, receiver_expr, owner, method, args) = match &expr.kind {
            ExprKind::Call {
                receiver,
                method,
                args,
            } => {
                let receiver_type = match receiver {
                    Some(receiver) => self.annotated_type(receiver, scope, flow)?,
                    None => self.this_type(scope),
                };
                let receiver_expr = match receiver {
                    Some(receiver) => FlowExpr::from_tree(receiver).unwrap_or(FlowExpr::Unknown),
                    None => FlowExpr::This,
                };
                let class_name = match &receiver_type.kind {
                    TypeKind::Declared { name, .. } => name.clone(),
                    _ => return Ok(None),
                };
                let Some((owner, declared)) = self.find_method(&class_name, method, args.len())
                else {
                    return Ok(None);
                };
                (Some(receiver_type), receiver_expr, owner, declared, args)
            }
            ExprKind::New { args, .. } => {
                let Some((owner, constructor)) = self.find_constructor(expr) else {
                    return Ok(None);
                };
                (None, FlowExpr::Unknown, owner, constructor, args)
            }
            _ => return Ok(None),
        };

        let mut mapping = match receiver_type.as_ref() {
            Some(receiver_type) => self.class_substitution(owner, receiver_type)?,
            None => BTreeMap::new(),
        };
        for (param, arg) in method.params.iter().zip(args) {
            if let TypeSyntax::TypeVar { name, .. } = &param.ty {
                let declared_here = method.type_params.iter().any(|tp| &tp.name == name);
                if declared_here && !mapping.contains_key(name) {
                    let mut arg_type = self.annotated_type(arg, scope, flow)?;
                    arg_type.kind = match arg_type.kind {
                        TypeKind::Null => TypeKind::Declared {
                            name: "Object".to_string(),
                            args: Vec::new(),
                        },
                        other => other,
                    };
                    mapping.insert(name.clone(), arg_type);
                }
            }
        }

        let arg_exprs: Vec<FlowExpr> = args
            .iter()
            .map(|arg| FlowExpr::from_tree(arg).unwrap_or(FlowExpr::Unknown))
            .collect();
        let adapt = |ty: &AnnotatedType| -> AnnotatedType {
            ty.substitute(&mapping).map_qualifiers(&|qualifier| {
                qualifier.map_exprs(&|expr| expr.viewpoint_adapt(&receiver_expr, &arg_exprs))
            })
        };
        let declared = self.method_type(owner, method);
        Ok(Some(MethodSignature {
            owner,
            method,
            receiver: declared.receiver.as_ref().map(&adapt),
            params: declared.params.iter().map(&adapt).collect(),
            return_type: adapt(&declared.return_type),
            receiver_expr,
            arg_exprs,
        }))
    }

    /// Contracts of `method` whose qualifier belongs to this type system.
    pub(crate) fn contracts(&self, owner: &Class, method: &Method) -> Vec<ResolvedContract> {
        let ctx = self.declaration_context(owner, Some(method));
        let context = self.expression_context(&ctx);
        method
            .contracts
            .iter()
            .filter_map(|contract| {
                let qualifier = self.qualifier_from_annotation(&contract.qualifier, &ctx)?;
                let Standardized::Ok(target) = standardize(&contract.expression, &context) else {
                    return None;
                };
                Some(ResolvedContract {
                    kind: contract.kind,
                    target,
                    expression: contract.expression.clone(),
                    qualifier,
                })
            })
            .collect()
    }

    /// Unparsable dependent expressions in annotations written on a declaration.
    pub(crate) fn declaration_problems(
        &self,
        owner: &Class,
        method: Option<&Method>,
        syntax: &TypeSyntax,
    ) -> Vec<(String, String)> {
        let ctx = self.declaration_context(owner, method);
        self.syntax_problems(syntax, &ctx)
    }

    /// Unparsable dependent expressions in annotations written inside a body.
    pub(crate) fn body_problems(&self, scope: &MethodScope<'_>, syntax: &TypeSyntax) -> Vec<(String, String)> {
        let ctx = self.use_context(scope);
        self.syntax_problems(syntax, &ctx)
    }

    /// Contracts whose expression does not parse.
    pub(crate) fn contract_problems(&self, owner: &Class, method: &Method) -> Vec<(String, String)> {
        let ctx = self.declaration_context(owner, Some(method));
        let context = self.expression_context(&ctx);
        method
            .contracts
            .iter()
            .filter(|contract| {
                self.system
                    .hierarchy
                    .kinds()
                    .by_name(&contract.qualifier.name)
                    .is_some()
            })
            .filter_map(|contract| match standardize(&contract.expression, &context) {
                Standardized::Ok(_) => None,
                Standardized::ParseError {
                    expression,
                    message,
                } => Some((expression, message)),
            })
            .collect()
    }

    fn syntax_problems(&self, syntax: &TypeSyntax, ctx: &TypeContext<'_>) -> Vec<(String, String)> {
        let hierarchy = &self.system.hierarchy;
        syntax
            .all_annotations()
            .into_iter()
            .filter_map(|annotation| {
                let kind = hierarchy.kinds().by_name(&annotation.name)?;
                let arguments = hierarchy.kinds().kind(kind).arguments?;
                self.annotation_args(annotation, arguments, ctx).err()
            })
            .collect()
    }

    /// Declared type of a flow expression, for facts the store does not hold.
    pub(crate) fn declared_type_of(&self, expr: &FlowExpr, scope: &MethodScope<'_>) -> Option<AnnotatedType> {
        match expr {
            FlowExpr::Local(name) => self.variable_type(scope, name),
            FlowExpr::This => Some(self.this_type(scope)),
            FlowExpr::Field { receiver, field } => {
                let receiver_type = self.declared_type_of(receiver, scope)?;
                let ctx = self.use_context(scope);
                self.member_field_type(&receiver_type, receiver, field, &ctx).ok()
            }
            _ => None,
        }
    }
}

fn is_string(ty: &AnnotatedType) -> bool {
    ty.is_declared("String")
}

/// Replace primary qualifiers by flow values. On a type variable use, a value
/// equal to the bound keeps the use unannotated.
fn apply_refinement(ty: &mut AnnotatedType, value: &QualifierSet) {
    for qualifier in value.iter() {
        if ty.is_type_var()
            && ty.qualifiers.get(qualifier.top).is_none()
            && ty.primary(qualifier.top) == Some(qualifier)
        {
            continue;
        }
        ty.replace_qualifier(qualifier.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkers::builtin;
    use crate::test_harness::*;

    fn nullness() -> TypeSystem {
        builtin("nullness").expect("nullness")
    }

    #[test]
    fn locals_default_to_top_and_parameters_to_checker_default() {
        let system = nullness();
        let options = CheckerOptions::default();
        let units = vec![unit(
            "A.java",
            vec![class("A").method(
                method("m")
                    .param("p", declared("String"))
                    .body(vec![local_var("x", declared("String"), None)]),
            )],
        )];
        let factory = AnnotatedTypeFactory::new(&system, &units, &[], &options);
        let class = &units[0].classes[0];
        let scope = MethodScope::new(class, &class.methods[0]);

        let local = factory.variable_type(&scope, "x").expect("local");
        let param = factory.variable_type(&scope, "p").expect("param");
        assert_eq!(local.to_string(), "@Nullable String");
        assert_eq!(param.to_string(), "@NonNull String");
    }

    #[test]
    fn conservative_defaults_apply_to_unannotated_classes() {
        let system = nullness();
        let options = CheckerOptions {
            conservative_defaults: true,
            ..CheckerOptions::default()
        };
        let units = vec![unit(
            "A.java",
            vec![
                class("Legacy").method(method("get").returns(declared("String"))),
                class("Checked")
                    .annotation(Annotation::with_values(ANNOTATED_FOR, &["nullness"]))
                    .method(method("get").returns(declared("String"))),
            ],
        )];
        let factory = AnnotatedTypeFactory::new(&system, &units, &[], &options);
        let legacy = &units[0].classes[0];
        let checked = &units[0].classes[1];

        let legacy_type = factory.method_type(legacy, &legacy.methods[0]);
        let checked_type = factory.method_type(checked, &checked.methods[0]);
        assert_eq!(legacy_type.return_type.to_string(), "@Nullable String");
        assert_eq!(checked_type.return_type.to_string(), "@NonNull String");
    }

    #[test]
    fn source_classes_override_stub_classes() {
        let system = nullness();
        let options = CheckerOptions::default();
        let stubs = vec![StubFile {
            classes: vec![class("Lib").method(
                method("find").returns(declared_with("String", &["Nullable"])),
            )],
        }];
        let units = vec![unit(
            "Lib.java",
            vec![class("Lib").method(method("find").returns(declared("String")))],
        )];
        let factory = AnnotatedTypeFactory::new(&system, &units, &stubs, &options);
        let entry = factory.class("Lib").expect("class");
        assert!(!entry.from_stub);
        let (owner, found) = factory.find_method("Lib", "find", 0).expect("method");
        assert_eq!(
            factory.method_type(owner, found).return_type.to_string(),
            "@NonNull String"
        );
    }

    #[test]
    fn method_signature_substitutes_class_type_arguments() {
        let system = nullness();
        let options = CheckerOptions::default();
        let units = vec![unit(
            "Box.java",
            vec![
                class("Box")
                    .type_param(type_param("T"))
                    .method(method("get").returns(type_var("T"))),
                class("User").method(
                    method("use")
                        .param(
                            "box",
                            generic("Box", vec![declared_with("String", &["Nullable"])]),
                        )
                        .body(vec![expr_stmt(call(Some(local("box")), "get", vec![]))]),
                ),
            ],
        )];
        let mut units = units;
        number(&mut units);
        let factory = AnnotatedTypeFactory::new(&system, &units, &[], &options);
        let user = &units[0].classes[1];
        let scope = MethodScope::new(user, &user.methods[0]);
        let call_expr = first_expr(&user.methods[0]);

        let signature = factory
            .method_signature(call_expr, &scope, None)
            .expect("signature")
            .expect("resolved");
        assert_eq!(signature.return_type.to_string(), "@Nullable String");
    }

    #[test]
    fn extends_wildcard_captures_glb_with_declared_bound() {
        let system = nullness();
        let options = CheckerOptions::default();
        let units = vec![unit(
            "Box.java",
            vec![
                class("Box")
                    .type_param(type_param_bounded("T", declared("Object")))
                    .method(method("get").returns(type_var("T"))),
                class("User").method(
                    method("use")
                        .param(
                            "box",
                            generic(
                                "Box",
                                vec![wildcard_extends(declared_with("String", &["Nullable"]))],
                            ),
                        )
                        .body(vec![expr_stmt(call(Some(local("box")), "get", vec![]))]),
                ),
            ],
        )];
        let mut units = units;
        number(&mut units);
        let factory = AnnotatedTypeFactory::new(&system, &units, &[], &options);
        let user = &units[0].classes[1];
        let scope = MethodScope::new(user, &user.methods[0]);
        let call_expr = first_expr(&user.methods[0]);

        let signature = factory
            .method_signature(call_expr, &scope, None)
            .expect("signature")
            .expect("resolved");
        // The explicit bound `Object` defaults to @NonNull, so the capture is @NonNull.
        assert_eq!(signature.return_type.to_string(), "@NonNull String");
    }

    #[test]
    fn method_type_arguments_are_inferred_from_arguments() {
        let system = nullness();
        let options = CheckerOptions::default();
        let units = vec![unit(
            "Util.java",
            vec![
                class("Util").method(
                    method("identity")
                        .type_param(type_param("T"))
                        .param("value", type_var("T"))
                        .returns(type_var("T"))
                        .static_method(),
                ),
                class("User").method(method("use").body(vec![expr_stmt(call(
                    Some(class_name("Util")),
                    "identity",
                    vec![string_lit("text")],
                ))])),
            ],
        )];
        let mut units = units;
        number(&mut units);
        let factory = AnnotatedTypeFactory::new(&system, &units, &[], &options);
        let user = &units[0].classes[1];
        let scope = MethodScope::new(user, &user.methods[0]);
        let call_expr = first_expr(&user.methods[0]);

        let signature = factory
            .method_signature(call_expr, &scope, None)
            .expect("signature")
            .expect("resolved");
        assert_eq!(signature.return_type.to_string(), "@NonNull String");
    }

    #[test]
    fn dependent_parameters_are_adapted_to_arguments() {
        let system = builtin("upper_bound").expect("upper bound");
        let options = CheckerOptions::default();
        let units = vec![unit(
            "Arrays.java",
            vec![
                class("Arrays").method(
                    method("get")
                        .param("array", array_of(primitive("int")))
                        .param(
                            "index",
                            primitive_with("int", &[("LTLengthOf", &["array"])]),
                        )
                        .returns(primitive("int"))
                        .static_method(),
                ),
                class("User").method(
                    method("use")
                        .param("values", array_of(primitive("int")))
                        .body(vec![expr_stmt(call(
                            Some(class_name("Arrays")),
                            "get",
                            vec![local("values"), int_lit(0)],
                        ))]),
                ),
            ],
        )];
        let mut units = units;
        number(&mut units);
        let factory = AnnotatedTypeFactory::new(&system, &units, &[], &options);
        let user = &units[0].classes[1];
        let scope = MethodScope::new(user, &user.methods[0]);
        let call_expr = first_expr(&user.methods[0]);

        let signature = factory
            .method_signature(call_expr, &scope, None)
            .expect("signature")
            .expect("resolved");
        assert_eq!(
            signature.params[1].to_string(),
            "@LTLengthOf(\"values\") int"
        );
    }

    #[test]
    fn unparsable_dependent_expression_becomes_bottom() {
        let system = builtin("upper_bound").expect("upper bound");
        let options = CheckerOptions::default();
        let broken = primitive_with("int", &[("LTLengthOf", &["nope("])]);
        let units = vec![unit(
            "A.java",
            vec![class("A").method(method("m").param("i", broken.clone()))],
        )];
        let factory = AnnotatedTypeFactory::new(&system, &units, &[], &options);
        let class = &units[0].classes[0];
        let method_type = factory.method_type(class, &class.methods[0]);
        assert_eq!(method_type.params[0].to_string(), "@UpperBoundBottom int");
        let problems = factory.declaration_problems(class, Some(&class.methods[0]), &broken);
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].0, "nope(");
    }
}
