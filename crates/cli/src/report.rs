//! Plain-text rendering of a theme forest.

use theme_protocol::{ExpansionState, ThemeForest, ThemeNode};

pub fn render_report(forest: &ThemeForest) -> String {
    let mut md = String::new();
    md.push_str("# Theme report\n\n");
    md.push_str(&format!("- Roots: {}\n", forest.roots.len()));
    md.push_str(&format!("- Themes: {}\n", forest.node_count()));
    let max_depth = forest
        .roots
        .iter()
        .map(ThemeNode::max_depth)
        .max()
        .unwrap_or(0);
    md.push_str(&format!("- Max depth: {max_depth}\n\n"));

    for root in &forest.roots {
        md.push_str(&format!("## {} ({})\n\n", root.name, root.id));
        if !root.business_context.is_empty() {
            md.push_str(&format!("{}\n\n", root.business_context));
        }
        render_node(root, &mut md);
        md.push('\n');
    }
    md
}

fn render_node(node: &ThemeNode, md: &mut String) {
    let indent = "  ".repeat(node.level);
    let files = node.affected_files().len();
    let lines = node.scope.line_count();
    let mut details = format!(
        "confidence {:.2}, {files} file{}, {lines} line{}",
        node.confidence,
        plural(files),
        plural(lines)
    );
    if let ExpansionState::Atomic { reason } = &node.expansion {
        details.push_str(&format!("; atomic: {reason}"));
    }
    for r in &node.cross_refs {
        details.push_str(&format!("; {} {}", r.label, r.target));
    }
    md.push_str(&format!("{indent}- [{}] {} ({details})\n", node.id, node.name));
    if !node.description.is_empty() {
        md.push_str(&format!("{indent}  {}\n", node.description));
    }
    for child in &node.children {
        render_node(child, md);
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}
