//! Closure and upvalue behavior

use pretty_assertions::assert_eq;
use rstest::rstest;
use sable_runtime::{Options, Sable};

fn run_with(source: &str, optimize: bool) -> String {
    let mut sable = Sable::with_options(Options {
        optimize,
        ..Options::default()
    });
    let buffer = sable.capture_output();
    sable
        .eval("closures.sbl", source)
        .unwrap_or_else(|e| panic!("interpretation failed (optimize={}): {}", optimize, e));
    let buffer = buffer.lock().unwrap();
    String::from_utf8_lossy(&buffer).to_string()
}

#[rstest]
#[case(true)]
#[case(false)]
fn two_closures_share_one_upvalue(#[case] optimize: bool) {
    let source = "fun mk() {\n\
                      var c := 0\n\
                      var inc := \\() { c := c + 1; return c }\n\
                      var get := \\() { return c }\n\
                      return { \"inc\": inc, \"get\": get }\n\
                  }\n\
                  var m := mk()\n\
                  m[\"inc\"]()\n\
                  m[\"inc\"]()\n\
                  print m[\"get\"]()";
    assert_eq!(run_with(source, optimize), "2\n");
}

#[rstest]
#[case(true)]
#[case(false)]
fn capture_chains_through_intermediate_functions(#[case] optimize: bool) {
    let source = "fun outer(x) {\n\
                      fun middle() {\n\
                          fun inner() { return x }\n\
                          return inner\n\
                      }\n\
                      return middle\n\
                  }\n\
                  print outer(9)()()";
    assert_eq!(run_with(source, optimize), "9\n");
}

#[rstest]
#[case(true)]
#[case(false)]
fn block_exit_closes_captured_locals(#[case] optimize: bool) {
    let source = "var f := nil\n\
                  {\n\
                      var n := 5\n\
                      f := \\() { return n }\n\
                  }\n\
                  print f()";
    assert_eq!(run_with(source, optimize), "5\n");
}

#[rstest]
#[case(true)]
#[case(false)]
fn closures_capture_loop_variable_snapshot(#[case] optimize: bool) {
    // One local, one upvalue: every closure sees the same storage.
    let source = "var fs := { }\n\
                  {\n\
                      var i := 0\n\
                      while i < 3 {\n\
                          fs[i] := \\() { return i }\n\
                          i := i + 1\n\
                      }\n\
                  }\n\
                  print fs[0]() + fs[1]() + fs[2]()";
    assert_eq!(run_with(source, optimize), "9\n");
}

#[rstest]
#[case(true)]
#[case(false)]
fn upvalue_writes_propagate_while_open(#[case] optimize: bool) {
    let source = "fun run() {\n\
                      var total := 0\n\
                      var add := \\(n) { total := total + n; return total }\n\
                      add(5)\n\
                      add(7)\n\
                      return total\n\
                  }\n\
                  print run()";
    assert_eq!(run_with(source, optimize), "12\n");
}

#[rstest]
#[case(true)]
#[case(false)]
fn lambda_immediately_callable(#[case] optimize: bool) {
    let source = "print (\\(a, b) { return a * b })(6, 7)";
    assert_eq!(run_with(source, optimize), "42\n");
}
