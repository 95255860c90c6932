//! XML generation utilities for libvirt domain definitions.
//!
//! A VNF image is either a disk image, for which a minimal KVM domain is
//! generated, or a domain XML template (`*.xml`) whose `{name}` and `{uuid}`
//! placeholders are filled in.

use quick_xml::escape::escape;

/// Builder for libvirt domain XML.
pub struct DomainXmlBuilder<'a> {
    name: &'a str,
    uuid: &'a str,
    disk_image: &'a str,
    memory_mib: u64,
    vcpus: u32,
    network: &'a str,
}

impl<'a> DomainXmlBuilder<'a> {
    /// Create a new XML builder for a domain booting from `disk_image`.
    pub fn new(name: &'a str, uuid: &'a str, disk_image: &'a str) -> Self {
        Self {
            name,
            uuid,
            disk_image,
            memory_mib: 1024,
            vcpus: 1,
            network: "default",
        }
    }

    pub fn memory_mib(mut self, memory_mib: u64) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    pub fn vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    /// Libvirt network the single NIC is attached to.
    pub fn network(mut self, network: &'a str) -> Self {
        self.network = network;
        self
    }

    /// Build the domain XML string.
    pub fn build(&self) -> String {
        let mut xml = String::new();

        xml.push_str(&format!(
            r#"<domain type='kvm'>
  <name>{}</name>
  <uuid>{}</uuid>
  <memory unit='MiB'>{}</memory>
  <vcpu placement='static'>{}</vcpu>
"#,
            escape(self.name),
            escape(self.uuid),
            self.memory_mib,
            self.vcpus
        ));

        xml.push_str(
            r#"  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <clock offset='utc'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
"#,
        );

        xml.push_str("  <devices>\n");
        xml.push_str(&self.build_disk());
        xml.push_str(&self.build_nic());
        xml.push_str(&self.build_console());
        xml.push_str(&self.build_agent_channel());
        xml.push_str("  </devices>\n");

        xml.push_str("</domain>\n");

        xml
    }

    fn build_disk(&self) -> String {
        let format = if self.disk_image.ends_with(".qcow2") { "qcow2" } else { "raw" };
        format!(
            r#"    <disk type='file' device='disk'>
      <driver name='qemu' type='{}' cache='none'/>
      <source file='{}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
"#,
            format,
            escape(self.disk_image)
        )
    }

    fn build_nic(&self) -> String {
        format!(
            r#"    <interface type='network'>
      <source network='{}'/>
      <model type='virtio'/>
    </interface>
"#,
            escape(self.network)
        )
    }

    fn build_console(&self) -> String {
        r#"    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
"#
        .to_string()
    }

    /// Guest agent channel, required for in-guest command execution.
    fn build_agent_channel(&self) -> String {
        r#"    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
"#
        .to_string()
    }
}

/// Fill the `{name}` and `{uuid}` placeholders of a domain template.
pub fn render_template(template: &str, name: &str, uuid: &str) -> String {
    template
        .replace("{name}", &escape(name))
        .replace("{uuid}", &escape(uuid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_domain() {
        let xml = DomainXmlBuilder::new("alice-fw", "6f1c", "/var/lib/nfio/images/fw.qcow2")
            .memory_mib(2048)
            .vcpus(2)
            .build();

        assert!(xml.contains("<name>alice-fw</name>"));
        assert!(xml.contains("<uuid>6f1c</uuid>"));
        assert!(xml.contains("<memory unit='MiB'>2048</memory>"));
        assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
        assert!(xml.contains("type='qcow2'"));
        assert!(xml.contains("<source network='default'/>"));
        assert!(xml.contains("org.qemu.guest_agent.0"));
        assert!(xml.ends_with("</domain>\n"));
    }

    #[test]
    fn test_values_are_escaped() {
        let xml = DomainXmlBuilder::new("a<b", "u", "/img/it's.raw").build();
        assert!(xml.contains("<name>a&lt;b</name>"));
        assert!(xml.contains("it&apos;s.raw"));
        assert!(xml.contains("type='raw'"));
    }

    #[test]
    fn test_render_template() {
        let rendered = render_template(
            "<domain><name>{name}</name><uuid>{uuid}</uuid></domain>",
            "alice-fw",
            "6f1c",
        );
        assert_eq!(rendered, "<domain><name>alice-fw</name><uuid>6f1c</uuid></domain>");
    }
}
