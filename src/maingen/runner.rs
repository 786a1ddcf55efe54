// Purpose: Hold the test-driver source template and its fixed dependency list.
// Inputs/Outputs: Renders a complete main package from the collected targets.
// Invariants: DEPS must list exactly the packages the rendered source imports.
// Gotchas: Target aliases are pre-assigned; "_" keeps a variant linked without naming it.

use std::fmt::Write as _;

/// Packages the rendered driver always imports. The synthetic main node
/// gets an import edge for each of these.
pub const DEPS: &[&str] = &[
    "flag",
    "fmt",
    "os",
    "sort",
    "testing",
    "testing/internal/testdeps",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFunc {
    /// Package alias inside the driver, e.g. `pkg0`.
    pub package: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct Target {
    pub import_path: String,
    pub name: String,
    pub test_name: String,
    pub x_test_name: String,
    pub directory: String,
    pub import_test: bool,
    pub import_x_test: bool,
    /// Code for the per-package main hook: `defaultMain` or an alias-
    /// qualified `TestMain`.
    pub main: String,
    pub init_func: String,
    pub x_init_func: String,
    pub tests: Vec<TestFunc>,
    pub benchmarks: Vec<TestFunc>,
    pub test_complexity: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Context {
    pub targets: Vec<Target>,
}

/// Render the driver source. Packages run in ascending complexity order so
/// cheap packages report first.
pub fn render(ctx: &Context) -> String {
    let mut out = String::new();
    out.push_str("// Code generated by gophertest. DO NOT EDIT.\n\npackage main\n\nimport (\n");
    for dep in DEPS {
        let _ = writeln!(out, "\t\"{dep}\"");
    }
    if !ctx.targets.is_empty() {
        out.push('\n');
    }
    for target in &ctx.targets {
        if target.import_test {
            let _ = writeln!(out, "\t{} \"{}\"", target.test_name, target.import_path);
        }
        if target.import_x_test {
            let _ = writeln!(out, "\t{} \"{}_test\"", target.x_test_name, target.import_path);
        }
    }
    out.push_str(")\n\n");

    out.push_str(
        "type target struct {\n\
         \timportPath string\n\
         \tdirectory  string\n\
         \tmain       func(*testing.M)\n\
         \tinitFunc   func()\n\
         \txInitFunc  func()\n\
         \ttests      []testing.InternalTest\n\
         \tbenchmarks []testing.InternalBenchmark\n\
         \tcomplexity int64\n\
         }\n\n",
    );

    out.push_str("var targets = []target{\n");
    for target in &ctx.targets {
        out.push_str("\t{\n");
        let _ = writeln!(out, "\t\timportPath: {:?},", target.import_path);
        let _ = writeln!(out, "\t\tdirectory:  {:?},", target.directory);
        let _ = writeln!(out, "\t\tmain:       {},", target.main);
        let _ = writeln!(out, "\t\tinitFunc:   {},", target.init_func);
        let _ = writeln!(out, "\t\txInitFunc:  {},", target.x_init_func);
        let _ = writeln!(out, "\t\tcomplexity: {},", target.test_complexity);
        out.push_str("\t\ttests: []testing.InternalTest{\n");
        for test in &target.tests {
            let _ = writeln!(
                out,
                "\t\t\t{{Name: {:?}, F: {}.{}}},",
                test.name, test.package, test.name
            );
        }
        out.push_str("\t\t},\n");
        out.push_str("\t\tbenchmarks: []testing.InternalBenchmark{\n");
        for bench in &target.benchmarks {
            let _ = writeln!(
                out,
                "\t\t\t{{Name: {:?}, F: {}.{}}},",
                bench.name, bench.package, bench.name
            );
        }
        out.push_str("\t\t},\n");
        out.push_str("\t},\n");
    }
    out.push_str("}\n\n");

    out.push_str(
        "var exitCode = 0\n\n\
         func defaultMain(m *testing.M) {\n\
         \tif code := m.Run(); code != 0 {\n\
         \t\texitCode = code\n\
         \t}\n\
         }\n\n\
         func main() {\n\
         \tflag.Parse()\n\
         \tsort.SliceStable(targets, func(i, j int) bool {\n\
         \t\treturn targets[i].complexity < targets[j].complexity\n\
         \t})\n\
         \tfor _, t := range targets {\n\
         \t\tfmt.Printf(\"=== package %s\\n\", t.importPath)\n\
         \t\tif err := os.Chdir(t.directory); err != nil {\n\
         \t\t\tfmt.Fprintln(os.Stderr, err)\n\
         \t\t\texitCode = 1\n\
         \t\t\tcontinue\n\
         \t\t}\n\
         \t\tt.initFunc()\n\
         \t\tt.xInitFunc()\n\
         \t\tm := testing.MainStart(testdeps.TestDeps{}, t.tests, t.benchmarks, nil, nil)\n\
         \t\tt.main(m)\n\
         \t}\n\
         \tos.Exit(exitCode)\n\
         }\n",
    );

    out
}

#[cfg(test)]
mod tests {
    use super::{Context, Target, TestFunc, render};

    #[test]
    fn zero_targets_still_renders_a_driver() {
        let src = render(&Context::default());
        assert!(src.contains("package main"));
        assert!(src.contains("var targets = []target{\n}"));
        assert!(src.contains("func main() {"));
    }

    #[test]
    fn target_wiring_appears_with_aliases() {
        let ctx = Context {
            targets: vec![Target {
                import_path: "example.com/p".to_string(),
                name: "p".to_string(),
                test_name: "pkg0".to_string(),
                x_test_name: "pkg1".to_string(),
                directory: "/src/p".to_string(),
                import_test: true,
                import_x_test: true,
                main: "defaultMain".to_string(),
                init_func: "pkg0.GopherTestInit".to_string(),
                x_init_func: "func(){}".to_string(),
                tests: vec![TestFunc {
                    package: "pkg0".to_string(),
                    name: "TestX".to_string(),
                }],
                benchmarks: vec![TestFunc {
                    package: "pkg1".to_string(),
                    name: "BenchmarkY".to_string(),
                }],
                test_complexity: 7,
            }],
        };
        let src = render(&ctx);
        assert!(src.contains("pkg0 \"example.com/p\""));
        assert!(src.contains("pkg1 \"example.com/p_test\""));
        assert!(src.contains("initFunc:   pkg0.GopherTestInit,"));
        assert!(src.contains("{Name: \"TestX\", F: pkg0.TestX},"));
        assert!(src.contains("{Name: \"BenchmarkY\", F: pkg1.BenchmarkY},"));
    }
}
