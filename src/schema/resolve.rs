//! Name-path resolution for sequence lengths and variant tags.
//!
//! A sequence or variant field type carries a path string naming the
//! integer (respectively enumeration) field that holds its length
//! (respectively tag). Resolution converts that string into an absolute
//! [`FieldPath`] and validates that the target exists, precedes the
//! source in composite document order, and has the required kind.
//!
//! Resolution runs in two phases so the type walk never aliases the
//! mutation: an analyze pass collects one pending record per dynamic
//! type, then an apply pass installs the resolved paths.

use super::{
    path::ENV_PREFIX, EnumType, FieldPath, FieldType, Scope,
};
use crate::error::Error;
use std::sync::Arc;
use tracing::{debug, trace};

/// Resolver configuration.
#[derive(Copy, Clone, Debug)]
pub struct ResolveOptions {
    /// Whether a sequence may target a length field living in a
    /// previous scope (variants always may). The reference behavior is
    /// to permit it.
    pub allow_previous_scope_sequences: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            allow_previous_scope_sequences: true,
        }
    }
}

/// A read-only view of the six scope root types.
pub(crate) type ScopeView<'a> = [Option<&'a Arc<FieldType>>; 6];

/// Retrieves the type designated by `path` within the scope view.
pub(crate) fn field_type_at_path<'a>(
    scopes: &ScopeView<'a>,
    path: &FieldPath,
) -> Option<&'a Arc<FieldType>> {
    let mut ty = scopes[path.root.index()]?;
    for &index in path.indexes.iter() {
        ty = ty.child_at(index)?;
    }
    Some(ty)
}

/// Resolves every sequence and variant type reachable from the given
/// scope roots, in scope order. Frozen roots are already resolved and
/// only serve as lookup context. On error nothing is mutated beyond
/// the scopes already fully resolved.
pub(crate) fn resolve_types(
    scopes: &mut [Option<Arc<FieldType>>; 6],
    options: ResolveOptions,
) -> Result<(), Error> {
    for scope in Scope::ALL {
        let pending = {
            let view: ScopeView<'_> = std::array::from_fn(|i| scopes[i].as_ref());
            match view[scope.index()] {
                None => continue,
                Some(root) if root.is_frozen() => continue,
                Some(_) => {}
            }
            analyze_root(scope, &view, options)?
        };
        if pending.is_empty() {
            continue;
        }
        debug!(scope = %scope, count = pending.len(), "Resolved dynamic field types");
        let root = scopes[scope.index()]
            .as_mut()
            .expect("analyzed scope root is present");
        for resolution in pending {
            apply_resolution(root, &resolution.node_path, resolution.target)?;
        }
    }
    Ok(())
}

enum ResolvedTarget {
    SequenceLength(FieldPath),
    VariantTag(FieldPath, EnumType),
}

struct PendingResolution {
    /// Indexes from the scope root down to the dynamic type.
    node_path: Vec<i32>,
    target: ResolvedTarget,
}

/// A frame of the resolution stack: a compound type and the index of
/// the child currently being visited (`-1` for array/sequence element
/// types, which have no field index).
struct Frame<'a> {
    ty: &'a FieldType,
    index: i32,
}

struct AnalyzeCtx<'a, 'v> {
    view: &'v ScopeView<'a>,
    root_scope: Scope,
    stack: Vec<Frame<'a>>,
    pending: Vec<PendingResolution>,
    options: ResolveOptions,
}

fn analyze_root(
    scope: Scope,
    view: &ScopeView<'_>,
    options: ResolveOptions,
) -> Result<Vec<PendingResolution>, Error> {
    let root = view[scope.index()].expect("checked by caller");
    let mut ctx = AnalyzeCtx {
        view,
        root_scope: scope,
        stack: Vec::new(),
        pending: Vec::new(),
        options,
    };
    visit_type(root, &mut ctx)?;
    Ok(ctx.pending)
}

fn visit_type<'a>(ty: &'a FieldType, ctx: &mut AnalyzeCtx<'a, '_>) -> Result<(), Error> {
    match ty {
        FieldType::Sequence(seq) => {
            let target = resolve_path_string(seq.length_path(), ty, ctx)?;
            let node_path = ctx.stack.iter().map(|f| f.index).collect();
            ctx.pending.push(PendingResolution {
                node_path,
                target: ResolvedTarget::SequenceLength(target),
            });
        }
        FieldType::Variant(var) => {
            let target = resolve_path_string(var.tag_path(), ty, ctx)?;
            let tag_ty = field_type_at_path(ctx.view, &target)
                .and_then(|t| t.as_enum())
                .expect("validated as an enumeration");
            for option in var.options() {
                if !tag_ty.has_label(option.name.as_str()) {
                    return Err(Error::resolution(format!(
                        "variant option '{}' has no mapping in the tag enumeration",
                        option.name
                    )));
                }
            }
            let node_path = ctx.stack.iter().map(|f| f.index).collect();
            ctx.pending.push(PendingResolution {
                node_path,
                target: ResolvedTarget::VariantTag(target, tag_ty.clone()),
            });
        }
        _ => {}
    }

    if ty.is_compound() {
        ctx.stack.push(Frame { ty, index: 0 });
        let is_indexed = matches!(ty, FieldType::Struct(_) | FieldType::Variant(_));
        for f_index in 0..ty.field_count() {
            let index = if is_indexed { f_index as i32 } else { -1 };
            let child = ty
                .child_at(index)
                .ok_or_else(|| {
                    Error::resolution(format!(
                        "cannot get child type at index {f_index}/{}",
                        ty.field_count()
                    ))
                })?;
            ctx.stack
                .last_mut()
                .expect("frame pushed above")
                .index = index;
            visit_type(child, ctx)?;
        }
        ctx.stack.pop();
    }
    Ok(())
}

/// Converts a path string into a validated target field path relative
/// to the current resolution context.
fn resolve_path_string(
    pathstr: &str,
    source: &FieldType,
    ctx: &mut AnalyzeCtx<'_, '_>,
) -> Result<FieldPath, Error> {
    trace!(path = pathstr, scope = %ctx.root_scope, "Resolving path string");
    if pathstr.starts_with(ENV_PREFIX) {
        return Err(Error::resolution(
            "field types referring to the trace environment are not supported as of this version"
                .to_owned(),
        ));
    }

    let tokens = tokenize(pathstr)?;

    let target = if let Some(abs_scope) = Scope::from_absolute_path(pathstr) {
        let root = ctx.view[abs_scope.index()].ok_or_else(|| {
            Error::resolution(format!(
                "root type of scope {abs_scope} is not available (path string \"{pathstr}\")"
            ))
        })?;
        let indexes = follow_tokens(&tokens[abs_scope.prefix_token_count()..], root, i32::MAX)?;
        FieldPath {
            root: abs_scope,
            indexes,
        }
    } else {
        resolve_relative(&tokens, ctx).map_err(|e| {
            Error::resolution(format!(
                "cannot get relative field path of path string \"{pathstr}\" starting at root scope {}: {e}",
                ctx.root_scope
            ))
        })?
    };

    validate_target(&target, source, ctx)
        .map_err(|e| Error::resolution(format!("invalid target for path string \"{pathstr}\": {e}")))?;
    Ok(target)
}

/// Splits a path string on `.`, rejecting empty tokens.
fn tokenize(pathstr: &str) -> Result<Vec<&str>, Error> {
    let mut tokens = Vec::new();
    let mut position = 0;
    for token in pathstr.split('.') {
        if token.is_empty() {
            return Err(Error::resolution(format!(
                "empty token in path string \"{pathstr}\" at position {position}"
            )));
        }
        position += token.len() + 1;
        tokens.push(token);
    }
    Ok(tokens)
}

/// Follows path tokens down from `ty`, producing field-path indexes.
///
/// `src_index` is the index of the source looking for its target within
/// `ty`; at the first named level the target's index may not exceed it
/// (a field may only reference a field that precedes it). Array and
/// sequence levels contribute a `-1` index without consuming a token.
fn follow_tokens(tokens: &[&str], ty: &FieldType, src_index: i32) -> Result<Vec<i32>, Error> {
    let mut indexes = Vec::new();
    let mut cur = ty;
    let mut first_level_done = false;
    let mut remaining = tokens;

    while let Some(&token) = remaining.first() {
        let child_index = if matches!(cur, FieldType::Array(_) | FieldType::Sequence(_)) {
            -1
        } else {
            let index = cur.field_index(token).ok_or_else(|| {
                Error::resolution(format!("cannot get index of field type named \"{token}\""))
            })? as i32;
            if !first_level_done && index > src_index {
                return Err(Error::resolution(format!(
                    "field type \"{token}\" is located after the source (index {index} > {src_index})"
                )));
            }
            remaining = &remaining[1..];
            first_level_done = true;
            index
        };

        indexes.push(child_index);
        cur = cur.child_at(child_index).ok_or_else(|| {
            Error::resolution(format!(
                "cannot get child type at index {child_index} (field \"{token}\")"
            ))
        })?;
    }

    Ok(indexes)
}

/// Resolves a relative path: walk the resolution stack from the
/// innermost frame outward, then fall back to previous scopes.
fn resolve_relative(tokens: &[&str], ctx: &AnalyzeCtx<'_, '_>) -> Result<FieldPath, Error> {
    for parent_pos in (0..ctx.stack.len()).rev() {
        let frame = &ctx.stack[parent_pos];
        match follow_tokens(tokens, frame.ty, frame.index) {
            Ok(tail) => {
                let mut indexes: Vec<i32> = ctx.stack[..parent_pos].iter().map(|f| f.index).collect();
                indexes.extend(tail);
                return Ok(FieldPath {
                    root: ctx.root_scope,
                    indexes,
                });
            }
            Err(_) => continue, // Not found... yet
        }
    }

    // Not found in the current scope: look in previous scopes.
    let mut scope = ctx.root_scope.prev();
    while let Some(prev) = scope {
        if let Some(root) = ctx.view[prev.index()] {
            if let Ok(indexes) = follow_tokens(tokens, root, i32::MAX) {
                return Ok(FieldPath {
                    root: prev,
                    indexes,
                });
            }
        }
        scope = prev.prev();
    }

    Err(Error::resolution("no enclosing type contains the target"))
}

/// Index of the lowest common ancestor of two field paths rooted in the
/// same scope. Fails when one path is an ancestor of the other.
fn lca_index(a: &FieldPath, b: &FieldPath) -> Result<usize, Error> {
    debug_assert_eq!(a.root, b.root);
    let mut lca = 0;
    loop {
        if lca == a.indexes.len() || lca == b.indexes.len() {
            return Err(Error::resolution(
                "source and target field paths: one is an ancestor of the other",
            ));
        }
        if a.indexes[lca] != b.indexes[lca] {
            return Ok(lca);
        }
        lca += 1;
    }
}

/// Validates a resolved target against the source's position and kind.
fn validate_target(
    target: &FieldPath,
    source: &FieldType,
    ctx: &AnalyzeCtx<'_, '_>,
) -> Result<(), Error> {
    let ctx_path = FieldPath {
        root: ctx.root_scope,
        indexes: ctx.stack.iter().map(|f| f.index).collect(),
    };

    if target.indexes.is_empty() {
        return Err(Error::resolution(
            "target field path's length is 0 (targeting the root)",
        ));
    }

    if target.root > ctx_path.root {
        return Err(Error::resolution("target is located after the source"));
    }

    if target.root == ctx_path.root {
        let lca = lca_index(target, &ctx_path)?;
        let target_index = target.indexes[lca];
        let ctx_index = ctx_path.indexes[lca];
        if target_index >= ctx_index {
            return Err(Error::resolution(format!(
                "target index ({target_index}) is greater than or equal to the source index ({ctx_index}) in the lowest common ancestor"
            )));
        }
    }

    let target_ty = field_type_at_path(ctx.view, target)
        .ok_or_else(|| Error::resolution(format!("cannot get target field type at {target}")))?;

    match source {
        FieldType::Variant(_) => {
            if target_ty.as_enum().is_none() {
                return Err(Error::resolution(
                    "variant type's tag field type is not an enumeration",
                ));
            }
        }
        FieldType::Sequence(_) => {
            let is_unsigned_integer = target_ty
                .as_integer()
                .map(|t| !t.is_signed())
                .unwrap_or(false);
            if !is_unsigned_integer {
                return Err(Error::resolution(
                    "sequence type's length field type is not an unsigned integer",
                ));
            }
            if target.root != ctx.root_scope && !ctx.options.allow_previous_scope_sequences {
                return Err(Error::resolution(
                    "sequence length fields in a previous scope are disabled",
                ));
            }
        }
        _ => unreachable!("only sequences and variants are resolved"),
    }

    Ok(())
}

/// Installs a resolved target on the dynamic type at `node_path` below
/// `root`. Shared subtrees are copied on write so the installation
/// never reaches types owned elsewhere.
fn apply_resolution(
    root: &mut Arc<FieldType>,
    node_path: &[i32],
    target: ResolvedTarget,
) -> Result<(), Error> {
    let node = Arc::make_mut(root);
    if let Some((&head, rest)) = node_path.split_first() {
        let child = node.child_at_mut(head).ok_or_else(|| {
            Error::resolution(format!("cannot get child type at index {head}"))
        })?;
        return apply_resolution(child, rest, target);
    }

    match (node, target) {
        (FieldType::Sequence(seq), ResolvedTarget::SequenceLength(path)) => {
            trace!(%path, length_path = seq.length_path(), "Installing sequence length path");
            seq.set_resolved_length(path)
        }
        (FieldType::Variant(var), ResolvedTarget::VariantTag(path, tag)) => {
            trace!(%path, tag_path = var.tag_path(), "Installing variant tag path");
            var.set_resolved_tag(path, tag)
        }
        _ => Err(Error::resolution(
            "resolved node is not a sequence or variant",
        )),
    }
}
