//! Metadata on operators.
//!
//! Given a module for context, provide the operand types an operator
//! pops and the result types it pushes. Control operators, parametric
//! operators and local accesses are typed by the validator itself
//! (they depend on the control stack, the operand stack or the
//! function body) and are rejected here.

use crate::ir::{Module, Type};
use crate::ops::Operator;
use anyhow::Result;
use std::borrow::Cow;

pub fn op_inputs(module: &Module, op: &Operator) -> Result<Cow<'static, [Type]>> {
    use Operator::*;
    match op {
        Unreachable | Nop | Block { .. } | Loop { .. } | If { .. } | Else | End | Br { .. }
        | BrIf { .. } | BrTable { .. } | Return | Drop | Select | LocalGet { .. }
        | LocalSet { .. } | LocalTee { .. } => {
            anyhow::bail!("operator {} is typed by the validator", op.mnemonic())
        }

        Call { function_index } => {
            let sig = module.func_sig(*function_index);
            Ok(module.signatures[sig].params.clone().into())
        }
        CallIndirect { sig_index, .. } => {
            let mut params = module.signatures[*sig_index].params.clone();
            params.push(Type::I32);
            Ok(params.into())
        }

        GlobalGet { .. } => Ok(Cow::Borrowed(&[])),
        GlobalSet { global_index } => Ok(vec![module.globals[*global_index].ty].into()),

        I32Load { .. } | I64Load { .. } | F32Load { .. } | F64Load { .. } | I32Load8S { .. }
        | I32Load8U { .. } | I32Load16S { .. } | I32Load16U { .. } | I64Load8S { .. }
        | I64Load8U { .. } | I64Load16S { .. } | I64Load16U { .. } | I64Load32S { .. }
        | I64Load32U { .. } => Ok(Cow::Borrowed(&[Type::I32])),

        I32Store { .. } | I32Store8 { .. } | I32Store16 { .. } => {
            Ok(Cow::Borrowed(&[Type::I32, Type::I32]))
        }
        I64Store { .. } | I64Store8 { .. } | I64Store16 { .. } | I64Store32 { .. } => {
            Ok(Cow::Borrowed(&[Type::I32, Type::I64]))
        }
        F32Store { .. } => Ok(Cow::Borrowed(&[Type::I32, Type::F32])),
        F64Store { .. } => Ok(Cow::Borrowed(&[Type::I32, Type::F64])),

        MemorySize { .. } => Ok(Cow::Borrowed(&[])),
        MemoryGrow { .. } => Ok(Cow::Borrowed(&[Type::I32])),

        I32Const { .. } | I64Const { .. } | F32Const { .. } | F64Const { .. } => {
            Ok(Cow::Borrowed(&[]))
        }

        I32Eqz => Ok(Cow::Borrowed(&[Type::I32])),
        I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU | I32GeS | I32GeU => {
            Ok(Cow::Borrowed(&[Type::I32, Type::I32]))
        }
        I64Eqz => Ok(Cow::Borrowed(&[Type::I64])),
        I64Eq | I64Ne | I64LtS | I64LtU | I64GtS | I64GtU | I64LeS | I64LeU | I64GeS | I64GeU => {
            Ok(Cow::Borrowed(&[Type::I64, Type::I64]))
        }
        F32Eq | F32Ne | F32Lt | F32Gt | F32Le | F32Ge => {
            Ok(Cow::Borrowed(&[Type::F32, Type::F32]))
        }
        F64Eq | F64Ne | F64Lt | F64Gt | F64Le | F64Ge => {
            Ok(Cow::Borrowed(&[Type::F64, Type::F64]))
        }

        I32Clz | I32Ctz | I32Popcnt => Ok(Cow::Borrowed(&[Type::I32])),
        I32Add | I32Sub | I32Mul | I32DivS | I32DivU | I32RemS | I32RemU | I32And | I32Or
        | I32Xor | I32Shl | I32ShrS | I32ShrU | I32Rotl | I32Rotr => {
            Ok(Cow::Borrowed(&[Type::I32, Type::I32]))
        }
        I64Clz | I64Ctz | I64Popcnt => Ok(Cow::Borrowed(&[Type::I64])),
        I64Add | I64Sub | I64Mul | I64DivS | I64DivU | I64RemS | I64RemU | I64And | I64Or
        | I64Xor | I64Shl | I64ShrS | I64ShrU | I64Rotl | I64Rotr => {
            Ok(Cow::Borrowed(&[Type::I64, Type::I64]))
        }

        F32Abs | F32Neg | F32Ceil | F32Floor | F32Trunc | F32Nearest | F32Sqrt => {
            Ok(Cow::Borrowed(&[Type::F32]))
        }
        F32Add | F32Sub | F32Mul | F32Div | F32Min | F32Max | F32Copysign => {
            Ok(Cow::Borrowed(&[Type::F32, Type::F32]))
        }
        F64Abs | F64Neg | F64Ceil | F64Floor | F64Trunc | F64Nearest | F64Sqrt => {
            Ok(Cow::Borrowed(&[Type::F64]))
        }
        F64Add | F64Sub | F64Mul | F64Div | F64Min | F64Max | F64Copysign => {
            Ok(Cow::Borrowed(&[Type::F64, Type::F64]))
        }

        I32WrapI64 => Ok(Cow::Borrowed(&[Type::I64])),
        I32TruncF32S | I32TruncF32U => Ok(Cow::Borrowed(&[Type::F32])),
        I32TruncF64S | I32TruncF64U => Ok(Cow::Borrowed(&[Type::F64])),
        I64ExtendI32S | I64ExtendI32U => Ok(Cow::Borrowed(&[Type::I32])),
        I64TruncF32S | I64TruncF32U => Ok(Cow::Borrowed(&[Type::F32])),
        I64TruncF64S | I64TruncF64U => Ok(Cow::Borrowed(&[Type::F64])),
        F32ConvertI32S | F32ConvertI32U => Ok(Cow::Borrowed(&[Type::I32])),
        F32ConvertI64S | F32ConvertI64U => Ok(Cow::Borrowed(&[Type::I64])),
        F32DemoteF64 => Ok(Cow::Borrowed(&[Type::F64])),
        F64ConvertI32S | F64ConvertI32U => Ok(Cow::Borrowed(&[Type::I32])),
        F64ConvertI64S | F64ConvertI64U => Ok(Cow::Borrowed(&[Type::I64])),
        F64PromoteF32 => Ok(Cow::Borrowed(&[Type::F32])),
        I32ReinterpretF32 => Ok(Cow::Borrowed(&[Type::F32])),
        I64ReinterpretF64 => Ok(Cow::Borrowed(&[Type::F64])),
        F32ReinterpretI32 => Ok(Cow::Borrowed(&[Type::I32])),
        F64ReinterpretI64 => Ok(Cow::Borrowed(&[Type::I64])),

        I32Extend8S | I32Extend16S => Ok(Cow::Borrowed(&[Type::I32])),
        I64Extend8S | I64Extend16S | I64Extend32S => Ok(Cow::Borrowed(&[Type::I64])),
    }
}

pub fn op_outputs(module: &Module, op: &Operator) -> Result<Cow<'static, [Type]>> {
    use Operator::*;
    match op {
        Unreachable | Nop | Block { .. } | Loop { .. } | If { .. } | Else | End | Br { .. }
        | BrIf { .. } | BrTable { .. } | Return | Drop | Select | LocalGet { .. }
        | LocalSet { .. } | LocalTee { .. } => {
            anyhow::bail!("operator {} is typed by the validator", op.mnemonic())
        }

        Call { function_index } => {
            let sig = module.func_sig(*function_index);
            Ok(module.signatures[sig].results.clone().into())
        }
        CallIndirect { sig_index, .. } => {
            Ok(module.signatures[*sig_index].results.clone().into())
        }

        GlobalGet { global_index } => Ok(vec![module.globals[*global_index].ty].into()),
        GlobalSet { .. } => Ok(Cow::Borrowed(&[])),

        I32Load { .. } | I32Load8S { .. } | I32Load8U { .. } | I32Load16S { .. }
        | I32Load16U { .. } => Ok(Cow::Borrowed(&[Type::I32])),
        I64Load { .. } | I64Load8S { .. } | I64Load8U { .. } | I64Load16S { .. }
        | I64Load16U { .. } | I64Load32S { .. } | I64Load32U { .. } => {
            Ok(Cow::Borrowed(&[Type::I64]))
        }
        F32Load { .. } => Ok(Cow::Borrowed(&[Type::F32])),
        F64Load { .. } => Ok(Cow::Borrowed(&[Type::F64])),

        I32Store { .. } | I64Store { .. } | F32Store { .. } | F64Store { .. }
        | I32Store8 { .. } | I32Store16 { .. } | I64Store8 { .. } | I64Store16 { .. }
        | I64Store32 { .. } => Ok(Cow::Borrowed(&[])),

        MemorySize { .. } | MemoryGrow { .. } => Ok(Cow::Borrowed(&[Type::I32])),

        I32Const { .. } => Ok(Cow::Borrowed(&[Type::I32])),
        I64Const { .. } => Ok(Cow::Borrowed(&[Type::I64])),
        F32Const { .. } => Ok(Cow::Borrowed(&[Type::F32])),
        F64Const { .. } => Ok(Cow::Borrowed(&[Type::F64])),

        I32Eqz | I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU | I32GeS
        | I32GeU | I64Eqz | I64Eq | I64Ne | I64LtS | I64LtU | I64GtS | I64GtU | I64LeS
        | I64LeU | I64GeS | I64GeU | F32Eq | F32Ne | F32Lt | F32Gt | F32Le | F32Ge | F64Eq
        | F64Ne | F64Lt | F64Gt | F64Le | F64Ge => Ok(Cow::Borrowed(&[Type::I32])),

        I32Clz | I32Ctz | I32Popcnt | I32Add | I32Sub | I32Mul | I32DivS | I32DivU | I32RemS
        | I32RemU | I32And | I32Or | I32Xor | I32Shl | I32ShrS | I32ShrU | I32Rotl | I32Rotr => {
            Ok(Cow::Borrowed(&[Type::I32]))
        }
        I64Clz | I64Ctz | I64Popcnt | I64Add | I64Sub | I64Mul | I64DivS | I64DivU | I64RemS
        | I64RemU | I64And | I64Or | I64Xor | I64Shl | I64ShrS | I64ShrU | I64Rotl | I64Rotr => {
            Ok(Cow::Borrowed(&[Type::I64]))
        }

        F32Abs | F32Neg | F32Ceil | F32Floor | F32Trunc | F32Nearest | F32Sqrt | F32Add
        | F32Sub | F32Mul | F32Div | F32Min | F32Max | F32Copysign => {
            Ok(Cow::Borrowed(&[Type::F32]))
        }
        F64Abs | F64Neg | F64Ceil | F64Floor | F64Trunc | F64Nearest | F64Sqrt | F64Add
        | F64Sub | F64Mul | F64Div | F64Min | F64Max | F64Copysign => {
            Ok(Cow::Borrowed(&[Type::F64]))
        }

        I32WrapI64 | I32TruncF32S | I32TruncF32U | I32TruncF64S | I32TruncF64U => {
            Ok(Cow::Borrowed(&[Type::I32]))
        }
        I64ExtendI32S | I64ExtendI32U | I64TruncF32S | I64TruncF32U | I64TruncF64S
        | I64TruncF64U => Ok(Cow::Borrowed(&[Type::I64])),
        F32ConvertI32S | F32ConvertI32U | F32ConvertI64S | F32ConvertI64U | F32DemoteF64 => {
            Ok(Cow::Borrowed(&[Type::F32]))
        }
        F64ConvertI32S | F64ConvertI32U | F64ConvertI64S | F64ConvertI64U | F64PromoteF32 => {
            Ok(Cow::Borrowed(&[Type::F64]))
        }
        I32ReinterpretF32 => Ok(Cow::Borrowed(&[Type::I32])),
        I64ReinterpretF64 => Ok(Cow::Borrowed(&[Type::I64])),
        F32ReinterpretI32 => Ok(Cow::Borrowed(&[Type::F32])),
        F64ReinterpretI64 => Ok(Cow::Borrowed(&[Type::F64])),

        I32Extend8S | I32Extend16S => Ok(Cow::Borrowed(&[Type::I32])),
        I64Extend8S | I64Extend16S | I64Extend32S => Ok(Cow::Borrowed(&[Type::I64])),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{FuncDecl, SignatureData};

    #[test]
    fn call_types_from_signature() {
        let mut m = Module::empty("t");
        let sig = m.signatures.push(SignatureData {
            params: vec![Type::I32, Type::I32],
            results: vec![Type::I32],
        });
        let f = m.funcs.push(FuncDecl::Body(sig, Default::default()));
        let op = Operator::Call { function_index: f };
        assert_eq!(&*op_inputs(&m, &op).unwrap(), &[Type::I32, Type::I32]);
        assert_eq!(&*op_outputs(&m, &op).unwrap(), &[Type::I32]);
    }

    #[test]
    fn control_ops_are_rejected() {
        let m = Module::empty("t");
        assert!(op_inputs(&m, &Operator::Drop).is_err());
        assert!(op_outputs(&m, &Operator::End).is_err());
    }

    #[test]
    fn numeric_shapes() {
        let m = Module::empty("t");
        assert_eq!(
            &*op_inputs(&m, &Operator::I32Add).unwrap(),
            &[Type::I32, Type::I32]
        );
        assert_eq!(&*op_outputs(&m, &Operator::F64Lt).unwrap(), &[Type::I32]);
        assert_eq!(&*op_inputs(&m, &Operator::I64ExtendI32U).unwrap(), &[Type::I32]);
    }
}
