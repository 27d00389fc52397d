use tera::Tera;

use crate::constants::DROPDOWN_SENTINEL_VALUE;
use crate::errors::Result;
use crate::models::lab::SizeDefinition;
use crate::models::menu::MenuImages;

/// Template for the options form presented by JupyterHub before spawning.
const SPAWN_FORM_TEMPLATE: &str = r#"<table width="100%">
<tr>
  <th>Image</th>
  <th>Options</th>
</tr>
<tr>
  <td width="50%">
    {% for image in images %}
    <label>
      <input type="radio" name="image_list" value="{{ image.reference }}"
        {% if loop.first %}checked{% endif %}>
      {{ image.name }}
    </label><br>
    {% endfor %}
    <label>
      <input type="radio" name="image_list" value="{{ dropdown_sentinel }}">
      Select historical image:
    </label><br>
    <select name="image_dropdown">
      {% for image in dropdown %}
      <option value="{{ image.reference }}">{{ image.name }}</option>
      {% endfor %}
    </select>
  </td>
  <td width="50%">
    {% for size in sizes %}
    <label>
      <input type="radio" name="size" value="{{ size.value }}"
        {% if loop.first %}checked{% endif %}>
      {{ size.description }}
    </label><br>
    {% endfor %}
    <br>
    <label>
      <input type="checkbox" name="enable_debug" value="true">
      Enable debug logs
    </label><br>
    <label>
      <input type="checkbox" name="reset_user_env" value="true">
      Reset user environment: relocate .cache, .jupyter, and .local
    </label>
  </td>
</tr>
</table>
"#;

/// Page returned from the file-server route once the server is running.
const FILESERVER_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
  <head><title>File server</title></head>
  <body>
    <p>
      File server for {{ username }} is running. Point a WebDAV client at
      <a href="{{ base_url }}/files/{{ username }}">{{ base_url }}/files/{{ username }}</a>
      to access your files.
    </p>
  </body>
</html>
"#;

/// Render the HTML form and pages the controller serves.
pub struct FormService {
    tera: Tera,
    sizes: Vec<SizeDefinition>,
    base_url: String,
}

impl FormService {
    pub fn new(sizes: Vec<SizeDefinition>, base_url: &str) -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_template("spawn_form", SPAWN_FORM_TEMPLATE)?;
        tera.add_raw_template("fileserver", FILESERVER_TEMPLATE)?;
        Ok(FormService { tera, sizes, base_url: base_url.to_string() })
    }

    /// The spawner options form for a user, built from the current menu.
    pub fn generate_spawn_form(&self, menu: &MenuImages) -> Result<String> {
        let mut context = tera::Context::new();
        context.insert("images", &menu.menu);
        context.insert("dropdown", &menu.dropdown);
        context.insert("dropdown_sentinel", DROPDOWN_SENTINEL_VALUE);
        let sizes: Vec<serde_json::Value> = self
            .sizes
            .iter()
            .map(|size| {
                serde_json::json!({
                    "value": size.size.to_string(),
                    "description": size.description(),
                })
            })
            .collect();
        context.insert("sizes", &sizes);
        Ok(self.tera.render("spawn_form", &context)?)
    }

    /// The landing page pointing a user at their running file server.
    pub fn generate_fileserver_page(&self, username: &str) -> Result<String> {
        let mut context = tera::Context::new();
        context.insert("username", username);
        context.insert("base_url", &self.base_url);
        Ok(self.tera.render("fileserver", &context)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::lab::LabSize;
    use crate::models::menu::MenuImage;

    fn form_service() -> FormService {
        let sizes = vec![
            SizeDefinition { size: LabSize::Small, cpu: 1.0, memory: "2GiB".to_string() },
            SizeDefinition { size: LabSize::Medium, cpu: 2.0, memory: "4GiB".to_string() },
        ];
        FormService::new(sizes, "https://data.example.org").unwrap()
    }

    #[test]
    fn test_spawn_form() {
        let menu = MenuImages {
            menu: vec![MenuImage {
                reference: "lighthouse.ceres/library/sketchbook:recommended@sha256:1234".to_string(),
                name: "Recommended (Weekly 2077_46)".to_string(),
            }],
            dropdown: vec![MenuImage {
                reference: "lighthouse.ceres/library/sketchbook:d_2077_10_21".to_string(),
                name: "Daily 2077_10_21".to_string(),
            }],
        };
        let html = form_service().generate_spawn_form(&menu).unwrap();
        assert!(html.contains("Recommended (Weekly 2077_46)"));
        assert!(html.contains("Daily 2077_10_21"));
        assert!(html.contains(DROPDOWN_SENTINEL_VALUE));
        assert!(html.contains("Medium (2 CPU, 4GiB RAM)"));
        // The first image and size are preselected.
        assert!(html.contains("checked"));
    }

    #[test]
    fn test_fileserver_page() {
        let html = form_service().generate_fileserver_page("rachel").unwrap();
        assert!(html.contains("https://data.example.org/files/rachel"));
    }
}
