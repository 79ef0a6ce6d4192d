//! Runtime math support over f32.

use super::LIBRARY;
use crate::context::Context;
use crate::error::Result;
use crate::gc::Gc;
use crate::stack::OperandStack;

macro_rules! unary {
    ($($name:ident => $method:ident,)*) => {
        $(
            fn $name(_gc: &mut Gc, stack: &mut OperandStack) -> Result<()> {
                let value = stack.pop_f32()?;
                stack.push_f32(value.$method())?;
                Ok(())
            }
        )*

        pub(super) fn register(ctx: &mut Context) -> Result<()> {
            $(ctx.register_native(LIBRARY, stringify!($name), $name)?;)*
            ctx.register_native(LIBRARY, "atan2", atan2)?;
            ctx.register_native(LIBRARY, "pow", pow)?;
            Ok(())
        }
    };
}

unary! {
    abs => abs,
    sqrt => sqrt,
    ceil => ceil,
    floor => floor,
    trunc => trunc,
    round => round,
    sin => sin,
    cos => cos,
    tan => tan,
    asin => asin,
    acos => acos,
    atan => atan,
}

/// `atan2(x: f32, y: f32) -> f32`
fn atan2(_gc: &mut Gc, stack: &mut OperandStack) -> Result<()> {
    let y = stack.pop_f32()?;
    let x = stack.pop_f32()?;
    stack.push_f32(x.atan2(y))?;
    Ok(())
}

/// `pow(base: f32, exponent: f32) -> f32`
fn pow(_gc: &mut Gc, stack: &mut OperandStack) -> Result<()> {
    let exponent = stack.pop_f32()?;
    let base = stack.pop_f32()?;
    stack.push_f32(base.powf(exponent))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unary_sqrt() {
        let mut gc = Gc::default();
        let mut stack = OperandStack::new(8);
        stack.push_f32(9.0).unwrap();
        sqrt(&mut gc, &mut stack).unwrap();
        assert_eq!(stack.pop_f32().unwrap(), 3.0);
    }

    #[test]
    fn test_pow() {
        let mut gc = Gc::default();
        let mut stack = OperandStack::new(8);
        stack.push_f32(2.0).unwrap();
        stack.push_f32(10.0).unwrap();
        pow(&mut gc, &mut stack).unwrap();
        assert_eq!(stack.pop_f32().unwrap(), 1024.0);
    }
}
