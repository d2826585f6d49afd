//!
//! The hook IR optimization pipeline.
//!

use indexmap::IndexMap;

use crate::ir::BinaryOp;
use crate::ir::Function;
use crate::ir::Inst;
use crate::ir::Module;
use crate::ir::Value;

/// Inlining recursion limit; hitting it means the payload has a call cycle.
const INLINE_DEPTH_LIMIT: u32 = 32;

///
/// The pass-pipeline error.
///
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PassError {
    /// Inlining exceeded the recursion limit.
    #[error("call cycle while inlining `{0}`")]
    CallCycle(String),
    /// A body instruction refers to a result that does not exist.
    #[error("dangling result reference in `{0}`")]
    DanglingResult(String),
}

///
/// Runs the standard pipeline over one function: inline transitive
/// module-defined callees, fold constants, drop dead instructions.
///
/// Only the named function is rewritten; the rest of the module is the
/// inlining source.
///
pub fn optimize_function(module: &mut Module, name: &str) -> Result<(), PassError> {
    let Some(function) = module.functions.get(name).cloned() else {
        return Ok(());
    };
    let inlined = inline_calls(&module.functions, &function, 0)?;
    let folded = fold_constants(inlined);
    let cleaned = eliminate_dead(folded, name)?;
    module
        .functions
        .insert(name.to_owned(), Function { body: cleaned, ..function });
    Ok(())
}

///
/// Rewrites `function`'s body with every call to a module-defined function
/// replaced by the callee's body.
///
fn inline_calls(
    functions: &IndexMap<String, Function>,
    function: &Function,
    depth: u32,
) -> Result<Vec<Inst>, PassError> {
    if depth > INLINE_DEPTH_LIMIT {
        return Err(PassError::CallCycle(function.name.clone()));
    }

    let mut body = Vec::with_capacity(function.body.len());
    // Maps the original instruction index to the value now holding its
    // result.
    let mut remap: Vec<Value> = Vec::with_capacity(function.body.len());

    for inst in function.body.iter() {
        let mut inst = inst.clone();
        for value in inst.values_mut() {
            if let Value::Result(index) = value {
                *value = remap
                    .get(*index as usize)
                    .cloned()
                    .ok_or_else(|| PassError::DanglingResult(function.name.clone()))?;
            }
        }

        match inst {
            Inst::Call { callee, args } if functions.contains_key(callee.as_str()) => {
                let callee_function = &functions[callee.as_str()];
                let callee_body = inline_calls(functions, callee_function, depth + 1)?;
                let mut callee_remap: Vec<Value> = Vec::with_capacity(callee_body.len());
                let mut result = Value::Constant(0);
                for callee_inst in callee_body {
                    let mut callee_inst = callee_inst;
                    for value in callee_inst.values_mut() {
                        match value {
                            Value::Argument(index) => {
                                *value = args
                                    .get(*index as usize)
                                    .cloned()
                                    .ok_or_else(|| PassError::DanglingResult(callee.clone()))?;
                            }
                            Value::Result(index) => {
                                *value = callee_remap
                                    .get(*index as usize)
                                    .cloned()
                                    .ok_or_else(|| PassError::DanglingResult(callee.clone()))?;
                            }
                            _ => {}
                        }
                    }
                    if let Inst::Return { value } = callee_inst {
                        if let Some(value) = value {
                            result = value;
                        }
                        callee_remap.push(Value::Constant(0));
                        break;
                    }
                    body.push(callee_inst);
                    callee_remap.push(Value::Result(body.len() as u32 - 1));
                }
                remap.push(result);
            }
            inst => {
                body.push(inst);
                remap.push(Value::Result(body.len() as u32 - 1));
            }
        }
    }
    Ok(body)
}

///
/// Replaces binary operations over two constants with their result.
///
fn fold_constants(body: Vec<Inst>) -> Vec<Inst> {
    let mut folded = Vec::with_capacity(body.len());
    let mut remap: Vec<Value> = Vec::with_capacity(body.len());

    for inst in body {
        let mut inst = inst;
        for value in inst.values_mut() {
            if let Value::Result(index) = value {
                *value = remap[*index as usize].clone();
            }
        }
        match inst {
            Inst::Binary {
                op,
                lhs: Value::Constant(lhs),
                rhs: Value::Constant(rhs),
            } => {
                remap.push(Value::Constant(evaluate(op, lhs, rhs)));
            }
            inst => {
                folded.push(inst);
                remap.push(Value::Result(folded.len() as u32 - 1));
            }
        }
    }
    folded
}

fn evaluate(op: BinaryOp, lhs: i64, rhs: i64) -> i64 {
    let (lhs, rhs) = (lhs as u32, rhs as u32);
    let result = match op {
        BinaryOp::Add => lhs.wrapping_add(rhs),
        BinaryOp::Sub => lhs.wrapping_sub(rhs),
        BinaryOp::And => lhs & rhs,
        BinaryOp::Or => lhs | rhs,
        BinaryOp::Xor => lhs ^ rhs,
        BinaryOp::Shl => lhs.wrapping_shl(rhs & 31),
        BinaryOp::Mul => lhs.wrapping_mul(rhs),
    };
    result as i64
}

///
/// Drops pure instructions whose results are never used.
///
fn eliminate_dead(body: Vec<Inst>, name: &str) -> Result<Vec<Inst>, PassError> {
    let mut used = vec![false; body.len()];
    for inst in body.iter() {
        if inst.has_side_effects() {
            mark_values(inst, &mut used, name)?;
        }
    }
    // Uses propagate backwards through chains of pure instructions.
    for index in (0..body.len()).rev() {
        if used[index] {
            mark_values(&body[index], &mut used, name)?;
        }
    }

    let mut remap: Vec<Value> = Vec::with_capacity(body.len());
    let mut cleaned = Vec::with_capacity(body.len());
    for (index, inst) in body.into_iter().enumerate() {
        if !inst.has_side_effects() && !used[index] {
            remap.push(Value::Constant(0));
            continue;
        }
        let mut inst = inst;
        for value in inst.values_mut() {
            if let Value::Result(result) = value {
                *value = remap[*result as usize].clone();
            }
        }
        cleaned.push(inst);
        remap.push(Value::Result(cleaned.len() as u32 - 1));
    }
    Ok(cleaned)
}

fn mark_values(inst: &Inst, used: &mut [bool], name: &str) -> Result<(), PassError> {
    for value in inst.values() {
        if let Value::Result(index) = value {
            *used
                .get_mut(*index as usize)
                .ok_or_else(|| PassError::DanglingResult(name.to_owned()))? = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::ir::BinaryOp;
    use crate::ir::Function;
    use crate::ir::Inst;
    use crate::ir::Module;
    use crate::ir::Value;

    use super::optimize_function;

    fn module_with(functions: Vec<Function>) -> Module {
        let mut module = Module::new("test".to_owned(), "cu".to_owned());
        for function in functions {
            module.add_function(function);
        }
        module
    }

    #[test]
    fn inlines_and_folds_through_a_callee() {
        // helper(x) = x + 2; wrapper stores helper(40).
        let mut module = module_with(vec![
            Function {
                name: "helper".to_owned(),
                param_count: 1,
                is_hook: false,
                body: vec![
                    Inst::Binary {
                        op: BinaryOp::Add,
                        lhs: Value::Argument(0),
                        rhs: Value::Constant(2),
                    },
                    Inst::Return {
                        value: Some(Value::Result(0)),
                    },
                ],
            },
            Function {
                name: "wrapper".to_owned(),
                param_count: 0,
                is_hook: true,
                body: vec![
                    Inst::Call {
                        callee: "helper".to_owned(),
                        args: vec![Value::Constant(40)],
                    },
                    Inst::Store {
                        address: Value::GlobalAddress("counter".to_owned()),
                        value: Value::Result(0),
                    },
                    Inst::Return { value: None },
                ],
            },
        ]);

        optimize_function(&mut module, "wrapper").expect("Always valid");
        let wrapper = module.functions.get("wrapper").expect("Always exists");
        assert_eq!(
            wrapper.body,
            vec![
                Inst::Store {
                    address: Value::GlobalAddress("counter".to_owned()),
                    value: Value::Constant(42),
                },
                Inst::Return { value: None },
            ]
        );
    }

    #[test]
    fn drops_unused_pure_instructions() {
        let mut module = module_with(vec![Function {
            name: "hook".to_owned(),
            param_count: 0,
            is_hook: true,
            body: vec![
                Inst::Load {
                    address: Value::GlobalAddress("counter".to_owned()),
                },
                Inst::Return { value: None },
            ],
        }]);
        optimize_function(&mut module, "hook").expect("Always valid");
        assert_eq!(
            module.functions.get("hook").expect("Always exists").body,
            vec![Inst::Return { value: None }]
        );
    }

    #[test]
    fn reports_call_cycles() {
        let mut module = module_with(vec![Function {
            name: "loop".to_owned(),
            param_count: 0,
            is_hook: true,
            body: vec![
                Inst::Call {
                    callee: "loop".to_owned(),
                    args: vec![],
                },
                Inst::Return { value: None },
            ],
        }]);
        assert!(optimize_function(&mut module, "loop").is_err());
    }
}
