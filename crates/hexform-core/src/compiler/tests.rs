use super::*;
use crate::definition::{ByteOrder, Guard, LoopCondition, Operand, Step, VarTest};
use crate::store::{VariableStore, Width};

/// Wraps `fields` and `run` into an otherwise minimal document
fn document(fields: &str, run: &str) -> String {
    format!(
        r#"<format name="Test" short="TST">
  <endianness order="big"/>
  <magic><signature><match value="AB"/></signature></magic>
  <colors>
    <color id="hdr" index="2" background="true"/>
    <color id="body" index="5" name="Body"/>
  </colors>
  <field-defs>
{fields}
  </field-defs>
  <run>
{run}
  </run>
</format>"#
    )
}

fn compile_err(source: &str) -> CompileError {
    match compile(source) {
        Ok(_) => panic!("document unexpectedly compiled"),
        Err(e) => e,
    }
}

#[test]
fn test_minimal_document() {
    let source = document(
        r#"<field id="magic" name="Magic" color="hdr"><size fixed="1"/></field>"#,
        r#"<field ref="magic" var="m"/>"#,
    );
    let def = compile(&source).unwrap();

    assert_eq!(def.name(), "Test");
    assert_eq!(def.short_name(), "TST");
    assert_eq!(def.endianness(), &Endianness::Big);
    assert_eq!(def.signatures().len(), 1);
    assert_eq!(def.program().len(), 1);
    assert_eq!(def.variables(), ["m".to_string()]);

    let magic = def.field(def.find_field("magic").unwrap());
    assert_eq!(magic.size, SizeMode::Fixed(1));
    assert_eq!(def.color_style(magic.color), (2, true));
    assert_eq!(def.unused_field().name, "unused data");
}

#[test]
fn test_colors_default_their_name() {
    let def = compile(&document(
        r#"<field id="x"><size fixed="1"/></field>"#,
        r#"<field ref="x"/>"#,
    ))
    .unwrap();
    assert_eq!(def.colors()[0].name, "hdr");
    assert_eq!(def.colors()[1].name, "Body");
    assert!(!def.colors()[1].background);
}

#[test]
fn test_forward_references_resolve() {
    let source = r#"<format name="Fwd" short="FWD">
  <endianness order="little"/>
  <magic><signature><match value="00"/></signature></magic>
  <colors/>
  <block-defs>
    <block-def id="header"><field ref="later"/></block-def>
  </block-defs>
  <field-defs>
    <field id="later"><size fixed="2"/></field>
  </field-defs>
  <run><block ref="header"/></run>
</format>"#;
    let def = compile(source).unwrap();
    assert_eq!(def.blocks().len(), 1);
    assert!(matches!(def.program()[0], Step::Block(_)));
}

#[test]
fn test_undefined_field_reports_first_use() {
    let source = document(
        r#"<field id="a"><size fixed="1"/></field>"#,
        "    <field ref=\"a\"/>\n    <field ref=\"missing\"/>",
    );
    let err = compile_err(&source);
    assert_eq!(
        err.kind,
        CompileErrorKind::Undefined {
            kind: "field",
            name: "missing".into()
        }
    );
    assert_eq!(err.element, "field");
    let line = source.lines().position(|l| l.contains("missing")).unwrap() + 1;
    assert_eq!(err.position.line, line);
    assert_eq!(err.position.column, 5);
}

#[test]
fn test_undefined_block_and_color() {
    let err = compile_err(&document(
        r#"<field id="a"><size fixed="1"/></field>"#,
        r#"<block ref="nope"/>"#,
    ));
    assert!(matches!(err.kind, CompileErrorKind::Undefined { kind: "block", .. }));

    let err = compile_err(&document(
        r#"<field id="a" color="purple"><size fixed="1"/></field>"#,
        r#"<field ref="a"/>"#,
    ));
    assert!(matches!(err.kind, CompileErrorKind::Undefined { kind: "color", .. }));
}

#[test]
fn test_mask_requires_fixed_size() {
    let err = compile_err(&document(
        r#"<field id="bad"><size remaining="true"/><mask value="0F"/></field>"#,
        r#"<field ref="bad"/>"#,
    ));
    assert_eq!(err.kind, CompileErrorKind::MaskOnVariableSize);
    assert_eq!(err.element, "field");
}

#[test]
fn test_mask_and_shift() {
    let def = compile(&document(
        r#"<field id="hi"><size fixed="1"/><mask value="F0"/><shift bits="4"/><print mode="uint"/></field>
<field id="lo"><size fixed="2"/><shift bits="3"/></field>"#,
        r#"<field ref="hi"/><field ref="lo"/>"#,
    ))
    .unwrap();
    let hi = def.field(def.find_field("hi").unwrap());
    assert_eq!(
        hi.bits,
        Some(BitField {
            mask: 0xF0,
            shift: 4
        })
    );
    assert_eq!(hi.print, PrintMode::Unsigned);

    let lo = def.field(def.find_field("lo").unwrap());
    assert_eq!(lo.bits.map(|b| b.mask), Some(0xFFFF));
}

#[test]
fn test_mask_wider_than_field() {
    let err = compile_err(&document(
        r#"<field id="f"><size fixed="1"/><mask value="FFFF"/></field>"#,
        r#"<field ref="f"/>"#,
    ));
    assert!(matches!(err.kind, CompileErrorKind::Invalid(_)));
}

#[test]
fn test_malformed_hex() {
    let err = compile_err(&document(
        r#"<field id="f"><size fixed="1"/></field>"#,
        r#"<match bytes="ABC"><field ref="f"/></match>"#,
    ));
    assert_eq!(err.kind, CompileErrorKind::MalformedHex("ABC".into()));
    assert_eq!(err.element, "match");
}

#[test]
fn test_duplicate_size() {
    let err = compile_err(&document(
        r#"<field id="f"><size fixed="1"/><size fixed="2"/></field>"#,
        r#"<field ref="f"/>"#,
    ));
    assert_eq!(err.kind, CompileErrorKind::Duplicate("size".into()));
}

#[test]
fn test_duplicate_field_id() {
    let err = compile_err(&document(
        r#"<field id="f"><size fixed="1"/></field><field id="f"><size fixed="1"/></field>"#,
        r#"<field ref="f"/>"#,
    ));
    assert!(matches!(err.kind, CompileErrorKind::Duplicate(_)));
}

#[test]
fn test_missing_size() {
    let err = compile_err(&document(r#"<field id="f"/>"#, r#"<field ref="f"/>"#));
    assert_eq!(err.kind, CompileErrorKind::MissingElement("size".into()));
}

#[test]
fn test_missing_section() {
    let err = compile_err(
        r#"<format name="X" short="X">
  <endianness order="big"/>
  <colors/>
  <field-defs/>
  <run/>
</format>"#,
    );
    assert_eq!(err.kind, CompileErrorKind::MissingElement("magic".into()));
    assert_eq!(err.position.line, 1);
}

#[test]
fn test_duplicate_section() {
    let err = compile_err(
        r#"<format name="X" short="X">
  <endianness order="big"/>
  <endianness order="little"/>
</format>"#,
    );
    assert_eq!(err.kind, CompileErrorKind::Duplicate("endianness".into()));
    assert_eq!(err.position.line, 3);
}

#[test]
fn test_unknown_attribute_and_element() {
    let err = compile_err(&document(
        r#"<field id="f" colour="hdr"><size fixed="1"/></field>"#,
        r#"<field ref="f"/>"#,
    ));
    assert_eq!(err.kind, CompileErrorKind::UnexpectedAttribute("colour".into()));

    let err = compile_err(&document(
        r#"<field id="f"><size fixed="1"/></field>"#,
        r#"<jump to="f"/>"#,
    ));
    assert_eq!(err.kind, CompileErrorKind::UnexpectedElement);
    assert_eq!(err.element, "jump");
}

#[test]
fn test_text_content_rejected() {
    let err = compile_err(&document(
        r#"<field id="f"><size fixed="1"/></field>"#,
        "stray words",
    ));
    assert_eq!(err.kind, CompileErrorKind::UnexpectedText("stray words".into()));
}

#[test]
fn test_malformed_markup() {
    let err = compile_err(r#"<format name="X" short="X"><run></format>"#);
    assert!(matches!(err.kind, CompileErrorKind::Syntax(_)));
}

#[test]
fn test_nested_steps_are_flattened() {
    let def = compile(&document(
        r#"<field id="f"><size fixed="1"/></field>"#,
        r#"<loop remaining="true" count="4">
  <selection>
    <match var="t" eq="1"><field ref="f"/></match>
    <match bytes="0102" convert="true"><field ref="f"/></match>
  </selection>
</loop>"#,
    ))
    .unwrap();

    let program = def.program();
    assert_eq!(program.len(), 10);
    assert!(matches!(
        program[0],
        Step::LoopStart(LoopGuard {
            condition: LoopCondition::Remaining,
            max_iterations: Some(4)
        })
    ));
    assert!(matches!(program[1], Step::SelectionStart));
    assert!(matches!(
        program[2],
        Step::MatchStart(Guard::Var {
            test: VarTest::Equals(Operand::Literal(1)),
            ..
        })
    ));
    assert!(matches!(program[4], Step::MatchEnd));
    assert!(matches!(
        program[5],
        Step::MatchStart(Guard::Bytes { convert: true, .. })
    ));
    assert!(matches!(program[8], Step::SelectionEnd));
    assert!(matches!(program[9], Step::LoopEnd));
}

#[test]
fn test_loop_until_and_exec() {
    let def = compile(&document(
        r#"<field id="f"><size fixed="1"/></field>"#,
        r#"<exec var="i" op="set" value="0" size="2"/>
<loop var="i" until="n">
  <field ref="f"/>
  <exec var="i" op="add" value="1"/>
</loop>"#,
    ))
    .unwrap();

    let i = def.find_variable("i").unwrap();
    let n = def.find_variable("n").unwrap();
    match &def.program()[0] {
        Step::Exec(exec) => {
            assert_eq!(exec.var, i);
            assert_eq!(exec.op, ArithOp::Set);
            assert_eq!(exec.width, Some(Width::Word));
        }
        other => panic!("unexpected step {:?}", other),
    }
    assert!(matches!(
        def.program()[1],
        Step::LoopStart(LoopGuard {
            condition: LoopCondition::Until { var, target: Operand::Var(t) },
            max_iterations: None
        }) if var == i && t == n
    ));
}

#[test]
fn test_loop_needs_condition() {
    let err = compile_err(&document(
        r#"<field id="f"><size fixed="1"/></field>"#,
        r#"<loop><field ref="f"/></loop>"#,
    ));
    assert!(matches!(err.kind, CompileErrorKind::Invalid(_)));

    let err = compile_err(&document(
        r#"<field id="f"><size fixed="1"/></field>"#,
        r#"<loop var="i"><field ref="f"/></loop>"#,
    ));
    assert_eq!(err.kind, CompileErrorKind::MissingAttribute("until".into()));
}

#[test]
fn test_match_takes_one_test() {
    let err = compile_err(&document(
        r#"<field id="f"><size fixed="1"/></field>"#,
        r#"<match var="t" eq="1" gt="2"/>"#,
    ));
    assert!(matches!(err.kind, CompileErrorKind::Invalid(_)));

    let def = compile(&document(
        r#"<field id="f"><size fixed="1"/></field>"#,
        r#"<match var="t" defined="true"/><match var="t" bit="0x80"/>"#,
    ))
    .unwrap();
    assert!(matches!(
        def.program()[0],
        Step::MatchStart(Guard::Var {
            test: VarTest::Defined,
            ..
        })
    ));
    assert!(matches!(
        def.program()[2],
        Step::MatchStart(Guard::Var {
            test: VarTest::BitSet(Operand::Literal(0x80)),
            ..
        })
    ));
}

#[test]
fn test_options_and_flags() {
    let def = compile(&document(
        r#"<field id="kind">
  <size fixed="2"/>
  <print mode="options"/>
  <options>
    <option name="Alpha" value="0001"/>
    <option name="Beta" value="0002"/>
  </options>
</field>
<field id="attrs">
  <size fixed="1"/>
  <print mode="flags"/>
  <flags>
    <flag name="READ" mask="01" meaning="readable"/>
    <flag name="WRITE" mask="02"/>
  </flags>
</field>"#,
        r#"<field ref="kind"/><field ref="attrs"/>"#,
    ))
    .unwrap();

    let kind = def.field(def.find_field("kind").unwrap());
    assert_eq!(kind.options.len(), 2);
    assert_eq!(kind.options[1].pattern, vec![0x00, 0x02]);

    let attrs = def.field(def.find_field("attrs").unwrap());
    assert_eq!(attrs.flags[0].meaning, "readable");
    assert_eq!(attrs.flags[1].mask, 2);
}

#[test]
fn test_option_width_must_match_field() {
    let err = compile_err(&document(
        r#"<field id="k"><size fixed="2"/><print mode="options"/><options><option name="A" value="01"/></options></field>"#,
        r#"<field ref="k"/>"#,
    ));
    assert!(matches!(err.kind, CompileErrorKind::Invalid(_)));
}

#[test]
fn test_options_mode_needs_table() {
    let err = compile_err(&document(
        r#"<field id="k"><size fixed="1"/><print mode="options"/></field>"#,
        r#"<field ref="k"/>"#,
    ));
    assert_eq!(err.kind, CompileErrorKind::MissingElement("options".into()));
}

#[test]
fn test_encoding_defaults_print_to_text() {
    let def = compile(&document(
        r#"<field id="name"><size terminator="00"/><encoding value="latin1"/></field>"#,
        r#"<field ref="name"/>"#,
    ))
    .unwrap();
    let name = def.field(def.find_field("name").unwrap());
    assert_eq!(name.size, SizeMode::Terminated(0));
    assert_eq!(name.encoding, Encoding::Latin1);
    assert_eq!(name.print, PrintMode::Text);
}

#[test]
fn test_variable_endianness() {
    let source = r#"<format name="Tiff" short="TIF">
  <endianness order="variable" var="order" big="4D4D" little="4949"/>
  <magic>
    <signature><read var="order" size="2"/></signature>
  </magic>
  <colors/>
  <field-defs><field id="f"><size fixed="2"/></field></field-defs>
  <run><field ref="f"/></run>
</format>"#;
    let def = compile(source).unwrap();
    let order = def.find_variable("order").unwrap();
    assert!(matches!(def.endianness(), Endianness::Variable { var, .. } if *var == order));
    assert_eq!(def.endianness().resolve(&VariableStore::new(1)), ByteOrder::Big);
    assert!(matches!(
        def.signatures()[0].steps[0],
        MagicStep::Read {
            width: Width::Word,
            ..
        }
    ));
}

#[test]
fn test_empty_signature_rejected() {
    let err = compile_err(
        r#"<format name="X" short="X">
  <endianness order="big"/>
  <magic><signature/></magic>
  <colors/><field-defs/><run/>
</format>"#,
    );
    assert_eq!(err.kind, CompileErrorKind::MissingElement("match".into()));
    assert_eq!(err.element, "signature");
}

#[test]
fn test_user_defined_unused_field() {
    let def = compile(&document(
        r#"<field id="unused" name="Padding" color="body"><size remaining="true"/></field>"#,
        "",
    ))
    .unwrap();
    assert_eq!(def.unused_field().name, "Padding");
    assert_eq!(def.color_style(def.unused_field().color), (5, false));
}

#[test]
fn test_nesting_limit() {
    let mut run = String::new();
    for _ in 0..MAX_NESTING {
        run.push_str("<selection>");
    }
    for _ in 0..MAX_NESTING {
        run.push_str("</selection>");
    }
    let err = compile_err(&document(r#"<field id="f"><size fixed="1"/></field>"#, &run));
    assert_eq!(err.kind, CompileErrorKind::TooDeep(MAX_NESTING));
}

#[test]
fn test_line_index() {
    let source = "ab\ncd\n\nef";
    let lines = LineIndex::new(source);
    assert_eq!(lines.position(source, 0).line, 1);
    let p = lines.position(source, 4);
    assert_eq!((p.line, p.column), (2, 2));
    let p = lines.position(source, 7);
    assert_eq!((p.line, p.column), (4, 1));
}

#[test]
fn test_compile_file_reports_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = compile_file(dir.path().join("absent.xml")).unwrap_err();
    assert!(matches!(err, Error::FileRead { .. }));
    assert!(err.is_recoverable());
}

#[test]
fn test_compile_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fmt.xml");
    std::fs::write(
        &path,
        document(r#"<field id="f"><size fixed="1"/></field>"#, r#"<field ref="f"/>"#),
    )
    .unwrap();
    let def = compile_file(&path).unwrap();
    assert_eq!(def.short_name(), "TST");
}
