//! Static analysis of parsed scripts.
//!
//! [`lint_script`] reports likely mistakes without running anything:
//! variables read before they are assigned, unused variables and arguments,
//! statements with no effect, and label problems.  Statement positions in
//! messages are zero-based indexes into the flat statement list.

use std::collections::{BTreeMap, HashSet};

use super::expr::Expr;
use super::stmt::{FunctionDef, Script, Statement};

/// Name → index of the first statement that assigns or uses it.
type FirstIndex = BTreeMap<String, usize>;

/// Lint a script and return its warnings in report order.
pub fn lint_script(script: &Script) -> Vec<String> {
    let statements = &script.statements;
    let mut warnings = Vec::new();

    if statements.is_empty() {
        warnings.push("Empty script".to_owned());
    }

    let (assigns, uses) = assignments_and_uses(statements);
    for (name, &assigned) in &assigns {
        if let Some(&used) = uses.get(name) {
            if used <= assigned {
                warnings.push(format!(
                    "Global variable \"{name}\" used (index {used}) before assignment (index {assigned})"
                ));
            }
        }
    }

    let mut functions = HashSet::new();
    let mut labels = LabelUse::default();
    for (ix, statement) in statements.iter().enumerate() {
        match statement {
            Statement::Function(def) => {
                if !functions.insert(def.name.as_str()) {
                    warnings.push(format!("Redefinition of function \"{}\" (index {ix})", def.name));
                }
                lint_function(def, ix, &mut warnings);
            }
            Statement::Expr { name: None, expr } if is_pointless(expr) => {
                warnings.push(format!("Pointless global statement (index {ix})"));
            }
            Statement::Label(label) => {
                if !labels.define(label, ix) {
                    warnings.push(format!("Redefinition of global label \"{label}\" (index {ix})"));
                }
            }
            Statement::Jump { label, .. } => labels.jump(label, ix),
            _ => {}
        }
    }
    for (label, ix) in labels.unused() {
        warnings.push(format!("Unused global label \"{label}\" (index {ix})"));
    }
    for (label, ix) in labels.unknown() {
        warnings.push(format!("Unknown global label \"{label}\" (index {ix})"));
    }

    warnings
}

fn lint_function(def: &FunctionDef, ix: usize, warnings: &mut Vec<String>) {
    let name = &def.name;
    let args: &[String] = def.args.as_deref().unwrap_or_default();

    let (assigns, uses) = assignments_and_uses(&def.statements);
    for (var, &assigned) in &assigns {
        if args.contains(var) {
            continue;
        }
        if let Some(&used) = uses.get(var) {
            if used <= assigned {
                warnings.push(format!(
                    "Variable \"{var}\" of function \"{name}\" used (index {used}) before assignment (index {assigned})"
                ));
            }
        }
    }
    for (var, &assigned) in &assigns {
        if !uses.contains_key(var) {
            warnings.push(format!("Unused variable \"{var}\" defined in function \"{name}\" (index {assigned})"));
        }
    }

    let mut seen = HashSet::new();
    for arg in args {
        if !seen.insert(arg.as_str()) {
            warnings.push(format!("Duplicate argument \"{arg}\" of function \"{name}\" (index {ix})"));
        } else if !uses.contains_key(arg) {
            warnings.push(format!("Unused argument \"{arg}\" of function \"{name}\" (index {ix})"));
        }
    }

    let mut labels = LabelUse::default();
    for (fn_ix, statement) in def.statements.iter().enumerate() {
        match statement {
            Statement::Expr { name: None, expr } if is_pointless(expr) => {
                warnings.push(format!("Pointless statement in function \"{name}\" (index {fn_ix})"));
            }
            Statement::Label(label) => {
                if !labels.define(label, fn_ix) {
                    warnings.push(format!(
                        "Redefinition of label \"{label}\" in function \"{name}\" (index {fn_ix})"
                    ));
                }
            }
            Statement::Jump { label, .. } => labels.jump(label, fn_ix),
            _ => {}
        }
    }
    for (label, fn_ix) in labels.unused() {
        warnings.push(format!("Unused label \"{label}\" in function \"{name}\" (index {fn_ix})"));
    }
    for (label, fn_ix) in labels.unknown() {
        warnings.push(format!("Unknown label \"{label}\" in function \"{name}\" (index {fn_ix})"));
    }
}

/// Label definitions (first wins) and jumps (last wins) in one statement list.
#[derive(Default)]
struct LabelUse<'a> {
    defined: BTreeMap<&'a str, usize>,
    used: BTreeMap<&'a str, usize>,
}

impl<'a> LabelUse<'a> {
    /// Record a definition; false if the label was already defined.
    fn define(&mut self, label: &'a str, ix: usize) -> bool {
        if self.defined.contains_key(label) {
            return false;
        }
        self.defined.insert(label, ix);
        true
    }

    fn jump(&mut self, label: &'a str, ix: usize) {
        self.used.insert(label, ix);
    }

    fn unused(&self) -> impl Iterator<Item = (&'a str, usize)> + '_ {
        self.defined.iter().filter(|(l, _)| !self.used.contains_key(*l)).map(|(&l, &ix)| (l, ix))
    }

    fn unknown(&self) -> impl Iterator<Item = (&'a str, usize)> + '_ {
        self.used.iter().filter(|(l, _)| !self.defined.contains_key(*l)).map(|(&l, &ix)| (l, ix))
    }
}

/// An expression with no function call anywhere in it.
fn is_pointless(expr: &Expr) -> bool {
    match expr {
        Expr::Function { .. } => false,
        Expr::Binary { left, right, .. } => is_pointless(left) && is_pointless(right),
        Expr::Unary { expr, .. } | Expr::Group(expr) => is_pointless(expr),
        Expr::Number(_) | Expr::Str(_) | Expr::Variable(_) => true,
    }
}

fn assignments_and_uses(statements: &[Statement]) -> (FirstIndex, FirstIndex) {
    let mut assigns = FirstIndex::new();
    let mut uses = FirstIndex::new();
    for (ix, statement) in statements.iter().enumerate() {
        match statement {
            Statement::Expr { name, expr } => {
                if let Some(name) = name {
                    assigns.entry(name.clone()).or_insert(ix);
                }
                expression_uses(expr, ix, &mut uses);
            }
            Statement::Jump { expr: Some(expr), .. } | Statement::Return { expr: Some(expr) } => {
                expression_uses(expr, ix, &mut uses);
            }
            _ => {}
        }
    }
    (assigns, uses)
}

/// Record variable reads and called function names.
fn expression_uses(expr: &Expr, ix: usize, uses: &mut FirstIndex) {
    match expr {
        Expr::Variable(name) => {
            uses.entry(name.clone()).or_insert(ix);
        }
        Expr::Function { name, args } => {
            uses.entry(name.clone()).or_insert(ix);
            for arg in args {
                expression_uses(arg, ix, uses);
            }
        }
        Expr::Binary { left, right, .. } => {
            expression_uses(left, ix, uses);
            expression_uses(right, ix, uses);
        }
        Expr::Unary { expr, .. } | Expr::Group(expr) => expression_uses(expr, ix, uses),
        Expr::Number(_) | Expr::Str(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::stmt::parse_script;

    fn lint(src: &str) -> Vec<String> {
        lint_script(&parse_script(src).expect("script parses"))
    }

    #[test]
    fn clean_script() {
        assert!(lint("a = 1\nb = a + 1\nsystemLog(b)").is_empty());
    }

    #[test]
    fn empty_script() {
        assert_eq!(lint(""), vec!["Empty script"]);
    }

    #[test]
    fn global_used_before_assignment() {
        assert_eq!(
            lint("systemLog(b)\nb = 1\na = a + 1"),
            vec![
                "Global variable \"a\" used (index 2) before assignment (index 2)",
                "Global variable \"b\" used (index 0) before assignment (index 1)",
            ]
        );
    }

    #[test]
    fn pointless_statements() {
        assert_eq!(
            lint("a = 1\na + 1\n(-a)\nsystemLog(a)\nfunction f():\n    'x'\n    return f2()\nendfunction"),
            vec![
                "Pointless global statement (index 1)",
                "Pointless global statement (index 2)",
                "Pointless statement in function \"f\" (index 0)",
            ]
        );
    }

    #[test]
    fn function_variables_and_arguments() {
        let src = "\
function f(a, b, a):
    x = y + a
    y = 1
    z = 2
    return x
endfunction
";
        assert_eq!(
            lint(src),
            vec![
                "Variable \"y\" of function \"f\" used (index 0) before assignment (index 1)",
                "Unused variable \"z\" defined in function \"f\" (index 2)",
                "Unused argument \"b\" of function \"f\" (index 0)",
                "Duplicate argument \"a\" of function \"f\" (index 0)",
            ]
        );
    }

    #[test]
    fn reassigned_arguments_are_not_flagged() {
        assert!(lint("function f(a):\n    a = a + 1\n    return a\nendfunction").is_empty());
    }

    #[test]
    fn function_redefinition() {
        let src = "function f():\n    return 1\nendfunction\nfunction f():\n    return 2\nendfunction";
        assert_eq!(lint(src), vec!["Redefinition of function \"f\" (index 1)"]);
    }

    #[test]
    fn global_labels() {
        assert_eq!(
            lint("top:\ntop:\nunused:\njump missing\njump top"),
            vec![
                "Redefinition of global label \"top\" (index 1)",
                "Unused global label \"unused\" (index 2)",
                "Unknown global label \"missing\" (index 3)",
            ]
        );
    }

    #[test]
    fn function_labels() {
        let src = "function f():\n    a:\n    a:\n    jump b\nendfunction";
        assert_eq!(
            lint(src),
            vec![
                "Redefinition of label \"a\" in function \"f\" (index 1)",
                "Unused label \"a\" in function \"f\" (index 0)",
                "Unknown label \"b\" in function \"f\" (index 2)",
            ]
        );
    }

    #[test]
    fn desugared_loops_are_clean() {
        let src = "\
n = 0
for v in arrayNew(1, 2):
    if v > 1:
        break
    endif
    n = n + v
endfor
systemLog(n)
";
        assert!(lint(src).is_empty(), "{:?}", lint(src));
    }
}
