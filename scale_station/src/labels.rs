/// Maps a detected class to the display name used on the nutrition page.
/// Classes not in the table pass through unchanged.
pub fn display_name(label: &str) -> &str {
    match label {
        "bell pepper" => "辣椒",
        "mushroom" | "mush" => "蘑菇",
        "banana" => "香蕉",
        "tomato" => "西红柿",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_classes_are_translated() {
        assert_eq!(display_name("banana"), "香蕉");
        assert_eq!(display_name("tomato"), "西红柿");
        assert_eq!(display_name("bell pepper"), "辣椒");
    }

    #[test]
    fn mushroom_aliases_share_a_display_name() {
        assert_eq!(display_name("mushroom"), display_name("mush"));
    }

    #[test]
    fn unknown_classes_pass_through() {
        assert_eq!(display_name("unknown_thing"), "unknown_thing");
    }
}
